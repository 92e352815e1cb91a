//! Egress adapter: engine enforcement around an outbound HTTP client.
//!
//! [`EgressClient`] evaluates every outbound request before it leaves the
//! process. Local rejections and upstream 429s can be retried under a
//! caller-supplied [`EgressResponseBuilder`], and with
//! `propagate_to_ingress` enabled they surface as
//! [`PropagatedTooManyRequests`] so the ingress middleware answers the
//! ambient inbound request with the same retry hint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::error::PropagatedTooManyRequests;
use crate::ingress::{limit_response, propagated_response};
use crate::limit::{LimitExceeded, RetryAfter};
use crate::rules::RequestAttributes;

/// Whether a rejected outbound attempt should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressDirective {
    /// Give up: surface the rejection to the caller.
    Fail,
    /// Sleep the retry hint and try again.
    Retry,
}

/// Caller-supplied retry policy for rejected outbound requests.
///
/// Consulted after every local rejection or upstream 429. `attempt` counts
/// prior retries of this call; there is no built-in upper bound, so the
/// builder is responsible for stopping the loop.
#[async_trait]
pub trait EgressResponseBuilder: Send + Sync {
    async fn build(
        &self,
        outcome: &LimitExceeded,
        request: &RequestAttributes,
        attempt: u32,
    ) -> EgressDirective;
}

/// Errors surfaced by [`EgressClient::execute`].
#[derive(Debug, Error)]
pub enum EgressError {
    /// The engine rejected the request before it left the process.
    #[error("Outbound request rate limited, retry after {}", .0.retry_after)]
    RateLimited(LimitExceeded),

    /// A rejection flagged for egress-to-ingress propagation.
    ///
    /// The signal stays the `source` so chain scans keep finding it after
    /// further wrapping.
    #[error("Too many requests signalled to ingress")]
    Propagated(#[from] PropagatedTooManyRequests),

    /// The underlying transport failed.
    #[error("Outbound transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl IntoResponse for EgressError {
    /// Render the error as the handler's response, keeping the
    /// propagation signal readable by the ingress middleware via a
    /// response extension.
    fn into_response(self) -> Response {
        match self {
            EgressError::Propagated(signal) => {
                let mut response = propagated_response(&signal);
                response.extensions_mut().insert(signal);
                response
            }
            EgressError::RateLimited(exceeded) => limit_response(&exceeded),
            EgressError::Transport(e) => {
                warn!(error = %e, "Outbound transport failure");
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("Upstream request failed"))
                    .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
            }
        }
    }
}

/// An engine-guarded wrapper around [`reqwest::Client`].
pub struct EgressClient {
    engine: Arc<Engine>,
    client: reqwest::Client,
    propagate_to_ingress: bool,
    builder: Option<Arc<dyn EgressResponseBuilder>>,
    clock: Arc<dyn Clock>,
}

impl EgressClient {
    pub fn new(engine: Arc<Engine>, client: reqwest::Client) -> Self {
        Self {
            engine,
            client,
            propagate_to_ingress: false,
            builder: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Raise rejections as [`PropagatedTooManyRequests`] so the ingress
    /// middleware can answer the surrounding request with them.
    pub fn propagate_to_ingress(mut self, enabled: bool) -> Self {
        self.propagate_to_ingress = enabled;
        self
    }

    pub fn with_response_builder(mut self, builder: Arc<dyn EgressResponseBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Issue `request` under the engine's egress rules.
    ///
    /// Admitted requests go out on the wrapped client. An upstream 429 is
    /// returned as-is unless the retry policy or propagation is
    /// configured. Requests whose bodies cannot be cloned skip the
    /// upstream-retry path.
    pub async fn execute(
        &self,
        mut request: reqwest::Request,
    ) -> Result<reqwest::Response, EgressError> {
        let mut attempt: u32 = 0;

        loop {
            let attributes = request_attributes(&request);
            let eval = self.engine.evaluate(&attributes).await;

            match eval.outcome().copied() {
                Some(exceeded) => {
                    eval.finish().await;
                    if self.should_retry(&exceeded, &attributes, attempt).await {
                        self.sleep_for(&exceeded).await;
                        attempt += 1;
                        continue;
                    }
                    if self.propagate_to_ingress {
                        debug!(
                            uri = %attributes.uri,
                            retry_after = %exceeded.retry_after,
                            "Propagating local egress rejection to ingress"
                        );
                        return Err(PropagatedTooManyRequests {
                            retry_after: exceeded.retry_after.to_string(),
                        }
                        .into());
                    }
                    return Err(EgressError::RateLimited(exceeded));
                }
                None => {
                    let replay = request.try_clone();
                    let sent = self.client.execute(request).await;
                    eval.finish().await;
                    let response = sent?;

                    if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
                        return Ok(response);
                    }

                    let retry_after = upstream_retry_after(&response);
                    let exceeded = LimitExceeded {
                        retry_after: RetryAfter::Seconds(retry_after.parse().unwrap_or(1)),
                    };

                    if let Some(replay) = replay {
                        if self.should_retry(&exceeded, &attributes, attempt).await {
                            self.sleep_for(&exceeded).await;
                            attempt += 1;
                            request = replay;
                            continue;
                        }
                    }

                    if self.propagate_to_ingress {
                        debug!(
                            uri = %attributes.uri,
                            retry_after = %retry_after,
                            "Propagating upstream 429 to ingress"
                        );
                        return Err(PropagatedTooManyRequests { retry_after }.into());
                    }
                    return Ok(response);
                }
            }
        }
    }

    async fn should_retry(
        &self,
        exceeded: &LimitExceeded,
        attributes: &RequestAttributes,
        attempt: u32,
    ) -> bool {
        match &self.builder {
            Some(builder) => {
                builder.build(exceeded, attributes, attempt).await == EgressDirective::Retry
            }
            None => false,
        }
    }

    async fn sleep_for(&self, exceeded: &LimitExceeded) {
        let delay = exceeded.retry_after.delay_secs(self.clock.now_unix());
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }
}

fn request_attributes(request: &reqwest::Request) -> RequestAttributes {
    let mut attributes = RequestAttributes::new(request.url().as_str(), request.method().as_str());
    attributes.headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    attributes
}

fn upstream_retry_after(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("1")
        .to_string()
}
