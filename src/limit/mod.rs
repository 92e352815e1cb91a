//! Rate-limit algorithms and their admission decisions.

mod fixed_window;
mod semaphore;
mod sliding_window;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::store::{CounterStore, StoreError};

/// Deferred work registered during a check and run exactly once when the
/// guarded request completes.
pub type Cleanup = BoxFuture<'static, ()>;

/// When a rejected caller may try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    /// Delta seconds (fixed and sliding window).
    Seconds(u64),
    /// Absolute unix timestamp: the moment a semaphore slot's TTL frees it.
    At(u64),
}

impl RetryAfter {
    /// Delay relative to `now`, clamped to at least one second.
    pub fn delay_secs(&self, now: u64) -> u64 {
        match self {
            RetryAfter::Seconds(secs) => (*secs).max(1),
            RetryAfter::At(at) => at.saturating_sub(now).max(1),
        }
    }
}

impl fmt::Display for RetryAfter {
    /// The `Retry-After` wire form: delta seconds, or the literal
    /// timestamp for the absolute variant.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryAfter::Seconds(secs) => write!(f, "{}", (*secs).max(1)),
            RetryAfter::At(at) => write!(f, "{at}"),
        }
    }
}

/// The normal "over limit" outcome. A value, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitExceeded {
    pub retry_after: RetryAfter,
}

/// Per-rule enforcement algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitMethod {
    /// At most `permit_limit` admissions per aligned interval.
    FixedWindow {
        permit_limit: u64,
        interval_secs: u64,
    },
    /// `permit_limit` admissions over a window of `num_buckets` rotating
    /// sub-intervals, smoothing the fixed window's edge burst.
    SlidingWindow {
        permit_limit: u64,
        interval_secs: u64,
        num_buckets: u64,
    },
    /// At most `permit_limit` requests in flight; slots leak back via TTL
    /// if a holder never completes.
    Semaphore {
        permit_limit: u64,
        timeout_secs: u64,
    },
}

impl RateLimitMethod {
    /// Run the admission check for one rule key.
    ///
    /// Increments whatever counters the algorithm owns, pushes any
    /// completion work onto `cleanups`, and returns the exceeded outcome
    /// if the request is over the limit.
    pub(crate) async fn check(
        &self,
        key_base: &str,
        store: &Arc<dyn CounterStore>,
        now: u64,
        cleanups: &mut Vec<Cleanup>,
    ) -> Result<Option<LimitExceeded>, StoreError> {
        match *self {
            RateLimitMethod::FixedWindow {
                permit_limit,
                interval_secs,
            } => fixed_window::check(permit_limit, interval_secs, key_base, store, now).await,
            RateLimitMethod::SlidingWindow {
                permit_limit,
                interval_secs,
                num_buckets,
            } => {
                sliding_window::check(
                    permit_limit,
                    interval_secs,
                    num_buckets,
                    key_base,
                    store,
                    now,
                )
                .await
            }
            RateLimitMethod::Semaphore {
                permit_limit,
                timeout_secs,
            } => {
                semaphore::check(permit_limit, timeout_secs, key_base, store, now, cleanups).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_clamped_to_one_second() {
        assert_eq!(RetryAfter::Seconds(0).delay_secs(100), 1);
        assert_eq!(RetryAfter::Seconds(7).delay_secs(100), 7);
        assert_eq!(RetryAfter::At(90).delay_secs(100), 1);
        assert_eq!(RetryAfter::At(130).delay_secs(100), 30);
    }

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(RetryAfter::Seconds(10).to_string(), "10");
        assert_eq!(RetryAfter::At(1_700_000_000).to_string(), "1700000000");
    }
}
