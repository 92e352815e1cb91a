//! Error types for the floodgate library.

use thiserror::Error;

/// Main error type for floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors (invalid settings, bad rule patterns)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The config producer failed while loading or refreshing
    #[error("Configuration load failed: {0}")]
    ConfigLoad(String),

    /// Counter store errors
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

/// Control-flow signal carrying a 429 decision from egress up to the
/// ingress boundary of the same logical request.
///
/// The signal travels two ways: as a typed error reachable through
/// `source()` chains (wrapping errors preserve it;
/// [`PropagatedTooManyRequests::find`] scans the chain), and as an HTTP
/// response extension so the ingress middleware can translate it without
/// inspecting handler error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Too many requests propagated from egress, retry after {retry_after}")]
pub struct PropagatedTooManyRequests {
    /// The `Retry-After` value, verbatim: delta seconds or a timestamp.
    pub retry_after: String,
}

impl PropagatedTooManyRequests {
    /// Scan an error's `source()` chain for a propagation signal.
    ///
    /// Consumers that aggregate or wrap errors keep the signal reachable
    /// as long as the wrapper reports it as a source.
    pub fn find<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a Self> {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(err) = current {
            if let Some(signal) = err.downcast_ref::<Self>() {
                return Some(signal);
            }
            current = err.source();
        }
        None
    }
}
