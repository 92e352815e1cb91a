//! Floodgate - Rate Limiting and Concurrency Control at the HTTP Boundary
//!
//! This crate decides, for each inbound request (ingress) and each
//! outbound request a service issues (egress), whether to admit the
//! request immediately, delay it, or reject it with a retry hint.
//! Decisions come from declarative [`rules`] evaluated against request
//! attributes and enforced by expiring counters in a pluggable
//! [`store`]. The [`engine`] fails open: a broken counter store or a
//! failing config producer suspends throttling instead of breaking the
//! service.
//!
//! Inbound traffic is guarded by the tower middleware in [`ingress`];
//! outbound traffic by the [`egress`] client wrapper, which can hand a
//! 429 decision back to the ingress response of the same request.

pub mod clock;
pub mod egress;
pub mod engine;
pub mod error;
pub mod ingress;
pub mod limit;
pub mod loader;
pub mod rules;
pub mod settings;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use egress::{EgressClient, EgressDirective, EgressError, EgressResponseBuilder};
pub use engine::{Engine, Evaluation};
pub use error::{FloodgateError, PropagatedTooManyRequests, Result};
pub use ingress::{EngineFactory, IngressDirective, IngressLayer, IngressResponseBuilder};
pub use limit::{LimitExceeded, RateLimitMethod, RetryAfter};
pub use loader::{ConfigLoader, ConfigProducer};
pub use rules::{Config, IdentityExtractor, RequestAttributes, Rule};
pub use settings::{
    Algorithm, EgressSettings, FloodgateSettings, RateLimitSettings, RuleSettings, SectionSettings,
};
pub use store::{CounterStore, MemoryCounterStore, StoreError};
