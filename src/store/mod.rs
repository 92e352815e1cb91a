//! Counter store contract for abstracting local and shared backends.

mod memory;

pub use memory::MemoryCounterStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by counter store backends.
///
/// The engine treats every store error as fail-open: the affected rule is
/// considered not exceeded and the failure is logged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
}

/// A keyspace of expiring counters shared by all rate-limit algorithms.
///
/// Implementations own TTL eviction: an entry whose expiry has passed must
/// eventually disappear without a client-initiated delete. The engine never
/// removes keys except through [`decrement`](CounterStore::decrement).
///
/// `now` is unix seconds and is passed in rather than read by the store so
/// that a backend shared between processes still agrees with the caller's
/// window arithmetic.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add 1 to the counter at `key`, set or extend its expiry
    /// to `now + ttl`, and return the post-increment value.
    async fn increment_and_get(
        &self,
        key: &str,
        ttl: Duration,
        now: u64,
    ) -> Result<u64, StoreError>;

    /// Read the current value at `key`; 0 if absent or expired.
    async fn get(&self, key: &str, now: u64) -> Result<u64, StoreError>;

    /// Best-effort decrement, never below zero. Only meaningful for the
    /// semaphore algorithm's slot release.
    async fn decrement(&self, key: &str) -> Result<(), StoreError>;
}
