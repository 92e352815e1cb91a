//! Process-local counter store.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

const DEFAULT_STRIPES: usize = 16;

/// One expiring counter.
struct Slot {
    count: u64,
    expires_at: u64,
}

/// In-memory [`CounterStore`] with per-stripe mutexes.
///
/// Keys are spread over a fixed set of stripes so concurrent requests for
/// unrelated counters do not contend on a single lock. Expiry is lazy: an
/// expired slot is treated as absent on access and reset on the next
/// increment. [`spawn_sweeper`](MemoryCounterStore::spawn_sweeper) adds a
/// periodic pass that frees slots no request touches anymore.
pub struct MemoryCounterStore {
    stripes: Vec<Mutex<HashMap<String, Slot>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    pub fn with_stripes(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<HashMap<String, Slot>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[index]
    }

    /// Drop every expired slot. Called by the sweeper task; also usable
    /// directly from tests.
    pub fn sweep(&self, now: u64) -> usize {
        let mut removed = 0;
        for stripe in &self.stripes {
            let mut map = stripe.lock();
            let before = map.len();
            map.retain(|_, slot| slot.expires_at > now);
            removed += before - map.len();
        }
        if removed > 0 {
            trace!(removed, "swept expired counters");
        }
        removed
    }

    /// Spawn a background task that sweeps expired slots every `interval`.
    ///
    /// The task runs until the returned handle is aborted or the runtime
    /// shuts down.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.sweep(SystemClock.now_unix());
            }
        })
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(
        &self,
        key: &str,
        ttl: Duration,
        now: u64,
    ) -> Result<u64, StoreError> {
        let mut map = self.stripe(key).lock();
        let slot = map.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at: 0,
        });
        if slot.expires_at <= now {
            slot.count = 0;
        }
        slot.count += 1;
        slot.expires_at = now + ttl.as_secs();
        Ok(slot.count)
    }

    async fn get(&self, key: &str, now: u64) -> Result<u64, StoreError> {
        let map = self.stripe(key).lock();
        Ok(map
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.count)
            .unwrap_or(0))
    }

    async fn decrement(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self.stripe(key).lock();
        if let Some(slot) = map.get_mut(key) {
            slot.count = slot.count.saturating_sub(1);
        }
        Ok(())
    }
}
