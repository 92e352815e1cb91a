//! Sliding window counter over rotating buckets.

use std::sync::Arc;
use std::time::Duration;

use super::{LimitExceeded, RetryAfter};
use crate::store::{CounterStore, StoreError};

/// Admit up to `permit_limit` requests over the last `interval_secs`,
/// tracked as `num_buckets` rotating sub-interval counters.
///
/// Only the current bucket is incremented; the other buckets are read and
/// summed, so the just-incremented bucket is counted exactly once. Each
/// bucket expires a full interval after its last touch, which is what
/// rotates old traffic out of the sum.
pub(super) async fn check(
    permit_limit: u64,
    interval_secs: u64,
    num_buckets: u64,
    key_base: &str,
    store: &Arc<dyn CounterStore>,
    now: u64,
) -> Result<Option<LimitExceeded>, StoreError> {
    let interval = interval_secs.max(1);
    let buckets = num_buckets.clamp(1, interval);
    let bucket_len = interval / buckets;
    let current = (now / bucket_len) % buckets;

    let mut total = store
        .increment_and_get(
            &format!("{key_base}|sw:{current}"),
            Duration::from_secs(interval),
            now,
        )
        .await?;

    for bucket in 0..buckets {
        if bucket == current {
            continue;
        }
        total += store.get(&format!("{key_base}|sw:{bucket}"), now).await?;
    }

    if total > permit_limit {
        return Ok(Some(LimitExceeded {
            retry_after: RetryAfter::Seconds(bucket_len.max(1)),
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
    async fn admits_up_to_limit_within_one_bucket() {
        let store = store();
        for _ in 0..6 {
            assert!(check(6, 12, 3, "k", &store, 0).await.unwrap().is_none());
        }
        let exceeded = check(6, 12, 3, "k", &store, 0).await.unwrap().unwrap();
        // Worst case until the oldest bucket rotates out: one bucket length.
        assert_eq!(exceeded.retry_after, RetryAfter::Seconds(4));
    }

    #[tokio::test]
    async fn counts_span_buckets() {
        let store = store();
        // Interval 12, 3 buckets of 4 seconds each.
        for _ in 0..3 {
            assert!(check(6, 12, 3, "k", &store, 0).await.unwrap().is_none());
        }
        for _ in 0..3 {
            assert!(check(6, 12, 3, "k", &store, 5).await.unwrap().is_none());
        }
        // Seventh request at t=9 sees 3 + 3 across live buckets.
        assert!(check(6, 12, 3, "k", &store, 9).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn old_buckets_rotate_out() {
        let store = store();
        for _ in 0..3 {
            check(6, 12, 3, "k", &store, 0).await.unwrap();
        }
        for _ in 0..3 {
            check(6, 12, 3, "k", &store, 5).await.unwrap();
        }
        assert!(check(6, 12, 3, "k", &store, 9).await.unwrap().is_some());

        // At t=13 the t=0 bucket has expired (ttl = interval = 12).
        assert!(check(6, 12, 3, "k", &store, 13).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn just_incremented_bucket_is_not_double_counted() {
        let store = store();
        // Limit 1: a single request must not read its own increment twice.
        assert!(check(1, 10, 2, "k", &store, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_bucket_degrades_to_fixed_behavior() {
        let store = store();
        assert!(check(1, 10, 1, "k", &store, 0).await.unwrap().is_none());
        let exceeded = check(1, 10, 1, "k", &store, 0).await.unwrap().unwrap();
        assert_eq!(exceeded.retry_after, RetryAfter::Seconds(10));
    }
}
