//! The rule-evaluation and counter-enforcement engine.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::limit::{Cleanup, LimitExceeded};
use crate::loader::ConfigLoader;
use crate::rules::{Config, RequestAttributes};
use crate::store::CounterStore;

/// Upper bound on a single cleanup routine.
const CLEANUP_DEADLINE: Duration = Duration::from_secs(10);

/// Evaluates requests against the current rule set and drives the
/// wait-or-reject decision.
///
/// One engine serves many concurrent requests; it holds shared references
/// to the [`ConfigLoader`] and the [`CounterStore`] and keeps no
/// per-request state of its own.
pub struct Engine {
    loader: Arc<ConfigLoader>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

/// The result of evaluating one request, holding the admission outcome and
/// the cleanup routines registered along the way.
///
/// Call [`finish`](Evaluation::finish) once the guarded request has
/// completed; every registered cleanup then runs exactly once, all
/// concurrently awaited. An `Evaluation` dropped without `finish` (a
/// cancelled request) spawns its pending cleanups onto the runtime instead
/// of leaking them.
#[must_use = "cleanups only run when the evaluation is finished"]
pub struct Evaluation {
    outcome: Option<LimitExceeded>,
    cleanups: Vec<Cleanup>,
}

impl Evaluation {
    fn new(outcome: Option<LimitExceeded>, cleanups: Vec<Cleanup>) -> Self {
        Self { outcome, cleanups }
    }

    /// The exceeded outcome, if the request was rejected.
    pub fn outcome(&self) -> Option<&LimitExceeded> {
        self.outcome.as_ref()
    }

    pub fn is_admitted(&self) -> bool {
        self.outcome.is_none()
    }

    /// Run every registered cleanup, awaiting them all.
    pub async fn finish(mut self) {
        let cleanups = mem::take(&mut self.cleanups);
        run_cleanups(cleanups).await;
    }
}

impl Drop for Evaluation {
    fn drop(&mut self) {
        if self.cleanups.is_empty() {
            return;
        }
        let cleanups = mem::take(&mut self.cleanups);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for cleanup in cleanups {
                    handle.spawn(async move {
                        let _ = tokio::time::timeout(CLEANUP_DEADLINE, cleanup).await;
                    });
                }
            }
            Err(_) => {
                warn!("Evaluation dropped outside a runtime; cleanup routines skipped");
            }
        }
    }
}

async fn run_cleanups(cleanups: Vec<Cleanup>) {
    if cleanups.is_empty() {
        return;
    }
    let bounded = cleanups.into_iter().map(|cleanup| async move {
        if tokio::time::timeout(CLEANUP_DEADLINE, cleanup).await.is_err() {
            warn!("Cleanup routine exceeded its deadline");
        }
    });
    futures::future::join_all(bounded).await;
}

/// One pass over the rule set.
struct Attempt {
    /// Worst exceeded outcome and the owning rule's max delay.
    worst: Option<(LimitExceeded, u64)>,
    cleanups: Vec<Cleanup>,
}

impl Engine {
    pub fn new(loader: Arc<ConfigLoader>, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(loader, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        loader: Arc<ConfigLoader>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            loader,
            store,
            clock,
        }
    }

    /// Decide whether `request` may proceed.
    ///
    /// Consults every matching rule so each one's counter is incremented,
    /// returns the exceeded outcome with the largest retry delay, and
    /// enters the wait loop when the deciding rule allows a delay. The
    /// returned [`Evaluation`] must be finished when the request
    /// completes.
    pub async fn evaluate(&self, request: &RequestAttributes) -> Evaluation {
        let config = self.loader.snapshot();

        if config.is_whitelisted(request) {
            trace!(uri = %request.uri, "Request whitelisted");
            return Evaluation::new(None, Vec::new());
        }

        let now = self.clock.now_unix();
        let attempt = self.check_rules(&config, request, now).await;

        match attempt.worst {
            None => Evaluation::new(None, attempt.cleanups),
            Some((exceeded, max_delay)) if max_delay > 0 => {
                self.wait_loop(&config, request, exceeded, attempt.cleanups, now + max_delay)
                    .await
            }
            Some((exceeded, _)) => Evaluation::new(Some(exceeded), attempt.cleanups),
        }
    }

    /// Release the loader's background refresh task.
    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
    }

    /// Evaluate every matching rule in declaration order.
    ///
    /// No short-circuit: a request that exceeds one rule is still counted
    /// against every other matching rule. Store failures admit for the
    /// affected rule only.
    async fn check_rules(
        &self,
        config: &Config,
        request: &RequestAttributes,
        now: u64,
    ) -> Attempt {
        let mut cleanups = Vec::new();
        let mut worst: Option<(LimitExceeded, u64)> = None;

        for rule in &config.rules {
            if !rule.matches(request) {
                continue;
            }
            let identity = rule.extract_identity(request);
            let key = rule.counter_key(&config.unique_name, &identity);
            trace!(key = %key, uri = %request.uri, "Checking rule");

            match rule.method.check(&key, &self.store, now, &mut cleanups).await {
                Ok(None) => {}
                Ok(Some(exceeded)) => {
                    debug!(
                        key = %key,
                        retry_after = %exceeded.retry_after,
                        "Rate limit exceeded"
                    );
                    let is_worse = worst
                        .map(|(current, _)| {
                            exceeded.retry_after.delay_secs(now)
                                > current.retry_after.delay_secs(now)
                        })
                        .unwrap_or(true);
                    if is_worse {
                        worst = Some((exceeded, rule.max_delay_secs));
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Counter store failed; admitting for this rule");
                }
            }
        }

        Attempt { worst, cleanups }
    }

    /// Delay instead of rejecting: retry the rule pass until admitted or
    /// the deadline passes.
    ///
    /// Each failed attempt's cleanups run before the sleep, so a rejected
    /// semaphore claim is compensated immediately rather than held across
    /// the wait.
    async fn wait_loop(
        &self,
        config: &Config,
        request: &RequestAttributes,
        mut exceeded: LimitExceeded,
        mut cleanups: Vec<Cleanup>,
        deadline: u64,
    ) -> Evaluation {
        loop {
            run_cleanups(cleanups).await;

            let now = self.clock.now_unix();
            let step = exceeded.retry_after.delay_secs(now).min(1);
            tokio::time::sleep(Duration::from_secs(step)).await;

            let now = self.clock.now_unix();
            let attempt = self.check_rules(config, request, now).await;
            match attempt.worst {
                None => return Evaluation::new(None, attempt.cleanups),
                Some((next, _)) => {
                    if now >= deadline {
                        debug!(
                            uri = %request.uri,
                            retry_after = %next.retry_after,
                            "Max delay exhausted, rejecting"
                        );
                        return Evaluation::new(Some(next), attempt.cleanups);
                    }
                    exceeded = next;
                    cleanups = attempt.cleanups;
                }
            }
        }
    }
}
