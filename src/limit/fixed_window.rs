//! Fixed window counter.

use std::sync::Arc;
use std::time::Duration;

use super::{LimitExceeded, RetryAfter};
use crate::store::{CounterStore, StoreError};

/// Admit up to `permit_limit` requests per aligned interval.
///
/// Windows are aligned to multiples of the interval, so every process
/// sharing a store agrees on the window boundary for a given `now`.
pub(super) async fn check(
    permit_limit: u64,
    interval_secs: u64,
    key_base: &str,
    store: &Arc<dyn CounterStore>,
    now: u64,
) -> Result<Option<LimitExceeded>, StoreError> {
    let interval = interval_secs.max(1);
    let window_start = (now / interval) * interval;
    let key = format!("{key_base}|fw:{window_start}");

    let count = store
        .increment_and_get(&key, Duration::from_secs(interval), now)
        .await?;

    if count > permit_limit {
        let retry_after = (window_start + interval).saturating_sub(now).max(1);
        return Ok(Some(LimitExceeded {
            retry_after: RetryAfter::Seconds(retry_after),
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn store() -> Arc<dyn CounterStore> {
        Arc::new(MemoryCounterStore::new())
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let store = store();
        for _ in 0..3 {
            let outcome = check(3, 10, "k", &store, 0).await.unwrap();
            assert!(outcome.is_none());
        }

        let exceeded = check(3, 10, "k", &store, 0).await.unwrap().unwrap();
        assert_eq!(exceeded.retry_after, RetryAfter::Seconds(10));
    }

    #[tokio::test]
    async fn tie_at_limit_admits() {
        let store = store();
        check(2, 10, "k", &store, 0).await.unwrap();
        // Second increment lands exactly on the limit.
        assert!(check(2, 10, "k", &store, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_window_resets_the_count() {
        let store = store();
        for _ in 0..2 {
            check(1, 10, "k", &store, 4).await.unwrap();
        }
        assert!(check(1, 10, "k", &store, 4).await.unwrap().is_some());

        // t=10 starts the next aligned window.
        assert!(check(1, 10, "k", &store, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_after_counts_down_within_the_window() {
        let store = store();
        check(1, 10, "k", &store, 7).await.unwrap();
        let exceeded = check(1, 10, "k", &store, 7).await.unwrap().unwrap();
        assert_eq!(exceeded.retry_after, RetryAfter::Seconds(3));
    }

    #[tokio::test]
    async fn retry_after_is_never_zero() {
        let store = store();
        check(1, 10, "k", &store, 9).await.unwrap();
        // One second left in the window either way.
        let exceeded = check(1, 10, "k", &store, 9).await.unwrap().unwrap();
        assert_eq!(exceeded.retry_after, RetryAfter::Seconds(1));
    }
}
