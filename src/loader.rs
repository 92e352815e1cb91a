//! Dynamic configuration loading with atomic hot swap.
//!
//! The loader owns the current [`Config`] behind an `ArcSwap`: readers
//! take a snapshot with a single pointer load and finish their request on
//! that snapshot even if a newer config is installed mid-evaluation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::rules::Config;

/// Produces a fresh [`Config`], typically by reading settings from a file
/// or a remote source.
pub type ConfigProducer = Arc<dyn Fn() -> BoxFuture<'static, Result<Config>> + Send + Sync>;

/// Holds the current rule set and keeps it fresh.
///
/// Construction invokes the producer once. If that initial load fails the
/// loader is **poisoned**: snapshots come back empty so the engine admits
/// everything, until a later refresh succeeds. A refresh failure after a
/// good install logs a warning and retains the current config.
pub struct ConfigLoader {
    current: ArcSwap<Config>,
    empty: Arc<Config>,
    poisoned: AtomicBool,
    shutdown: Notify,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigLoader {
    /// A loader over a static config; no producer, no background task.
    pub fn fixed(config: Config) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(config),
            empty: Arc::new(Config::default()),
            poisoned: AtomicBool::new(false),
            shutdown: Notify::new(),
            refresh_task: Mutex::new(None),
        })
    }

    /// Build a loader around `producer`, refreshing every
    /// `refresh_interval` when one is given.
    pub async fn new(
        producer: ConfigProducer,
        refresh_interval: Option<Duration>,
    ) -> Arc<Self> {
        let (initial, poisoned) = match producer().await {
            Ok(config) => {
                info!(
                    rules = config.rules.len(),
                    whitelist = config.whitelist.len(),
                    "Initial configuration loaded"
                );
                (config, false)
            }
            Err(e) => {
                error!(error = %e, "Initial configuration load failed; throttling is suspended");
                (Config::default(), true)
            }
        };

        let loader = Arc::new(Self {
            current: ArcSwap::from_pointee(initial),
            empty: Arc::new(Config::default()),
            poisoned: AtomicBool::new(poisoned),
            shutdown: Notify::new(),
            refresh_task: Mutex::new(None),
        });

        if let Some(interval) = refresh_interval.filter(|i| !i.is_zero()) {
            let task = tokio::spawn(refresh_loop(Arc::downgrade(&loader), producer, interval));
            *loader.refresh_task.lock() = Some(task);
        }

        loader
    }

    /// The config all rule evaluation for one request runs against.
    ///
    /// A poisoned loader yields the empty config (fail-open).
    pub fn snapshot(&self) -> Arc<Config> {
        if self.poisoned.load(Ordering::Acquire) {
            Arc::clone(&self.empty)
        } else {
            self.current.load_full()
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn install(&self, config: Config) {
        debug!(
            rules = config.rules.len(),
            whitelist = config.whitelist.len(),
            "Configuration refreshed"
        );
        self.current.store(Arc::new(config));
        if self.poisoned.swap(false, Ordering::AcqRel) {
            info!("Configuration recovered; throttling resumed");
        }
    }

    /// Cancel the refresh task and await its exit.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn refresh_loop(loader: Weak<ConfigLoader>, producer: ConfigProducer, interval: Duration) {
    loop {
        let shutdown = {
            // Hold the loader only long enough to register the wait.
            let Some(loader) = loader.upgrade() else {
                return;
            };
            tokio::select! {
                _ = loader.shutdown.notified() => true,
                _ = tokio::time::sleep(interval) => false,
            }
        };
        if shutdown {
            return;
        }

        let result = producer().await;
        let Some(loader) = loader.upgrade() else {
            return;
        };
        match result {
            Ok(config) => loader.install(config),
            Err(e) => {
                warn!(error = %e, "Configuration refresh failed; retaining current config");
            }
        }
    }
}
