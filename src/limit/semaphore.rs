//! Concurrency semaphore backed by a TTL counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{Cleanup, LimitExceeded, RetryAfter};
use crate::store::{CounterStore, StoreError};

/// Admit up to `permit_limit` concurrent requests.
///
/// Every check claims a slot by incrementing; a decrement cleanup is
/// always registered so the slot is released when the request completes.
/// On the exceeded path the same cleanup is the reject compensation,
/// keeping the live count tight. A holder that never completes leaks its
/// slot only until the `timeout_secs` TTL reclaims it.
pub(super) async fn check(
    permit_limit: u64,
    timeout_secs: u64,
    key_base: &str,
    store: &Arc<dyn CounterStore>,
    now: u64,
    cleanups: &mut Vec<Cleanup>,
) -> Result<Option<LimitExceeded>, StoreError> {
    let timeout = timeout_secs.max(1);
    let key = format!("{key_base}|sem");

    let count = store
        .increment_and_get(&key, Duration::from_secs(timeout), now)
        .await?;

    let release_store = Arc::clone(store);
    let release_key = key.clone();
    cleanups.push(Box::pin(async move {
        if let Err(e) = release_store.decrement(&release_key).await {
            warn!(key = %release_key, error = %e, "failed to release semaphore slot");
        }
    }));

    if count > permit_limit {
        return Ok(Some(LimitExceeded {
            retry_after: RetryAfter::At(now + timeout),
        }));
    }
    Ok(None)
}
