//! Ingress middleware: the engine as a tower layer.
//!
//! Apply [`IngressLayer`] to an axum router (or any tower stack) to
//! throttle inbound requests. Admitted requests flow to the inner
//! service; rejected ones get a 429 with a `Retry-After` hint, unless a
//! custom [`IngressResponseBuilder`] decides otherwise. Responses
//! carrying a [`PropagatedTooManyRequests`] extension (raised by the
//! egress adapter inside the handler) are translated into the same 429
//! shape.

use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tower::{Layer, Service};
use tracing::debug;

use crate::engine::Engine;
use crate::error::PropagatedTooManyRequests;
use crate::limit::{LimitExceeded, RetryAfter};
use crate::rules::RequestAttributes;

/// Async factory for middleware that must build its engine on first use,
/// when the surrounding services are finally available.
pub type EngineFactory = Arc<dyn Fn() -> BoxFuture<'static, Arc<Engine>> + Send + Sync>;

/// What the middleware does after a custom builder shaped the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressDirective {
    /// Return the (possibly mutated) limit response.
    UseResponse,
    /// Discard the limit outcome and call the downstream handler.
    ContinueAsNormal,
}

/// Custom shaping of the rejection response.
#[async_trait]
pub trait IngressResponseBuilder: Send + Sync {
    /// Invoked with the exceeded outcome, the request attributes, and the
    /// default 429 response, which it may mutate in place.
    async fn build(
        &self,
        outcome: &LimitExceeded,
        request: &RequestAttributes,
        response: &mut Response,
    ) -> IngressDirective;
}

/// Where the middleware gets its engine from.
enum EngineSource {
    Ready(Arc<Engine>),
    /// Built exactly once on the first request; `OnceCell` serializes
    /// racing initializers behind its internal lock while steady-state
    /// requests take the initialized fast path.
    Lazy {
        cell: OnceCell<Arc<Engine>>,
        factory: EngineFactory,
    },
}

impl EngineSource {
    async fn engine(&self) -> Arc<Engine> {
        match self {
            EngineSource::Ready(engine) => Arc::clone(engine),
            EngineSource::Lazy { cell, factory } => {
                Arc::clone(cell.get_or_init(|| factory()).await)
            }
        }
    }
}

/// Tower layer wiring the engine into a service stack.
#[derive(Clone)]
pub struct IngressLayer {
    source: Arc<EngineSource>,
    builder: Option<Arc<dyn IngressResponseBuilder>>,
}

impl IngressLayer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            source: Arc::new(EngineSource::Ready(engine)),
            builder: None,
        }
    }

    /// Defer engine construction to the first request.
    pub fn lazy(factory: EngineFactory) -> Self {
        Self {
            source: Arc::new(EngineSource::Lazy {
                cell: OnceCell::new(),
                factory,
            }),
            builder: None,
        }
    }

    pub fn with_response_builder(mut self, builder: Arc<dyn IngressResponseBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }
}

impl<S> Layer<S> for IngressLayer {
    type Service = IngressService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IngressService {
            inner,
            source: Arc::clone(&self.source),
            builder: self.builder.clone(),
        }
    }
}

/// The middleware service produced by [`IngressLayer`].
#[derive(Clone)]
pub struct IngressService<S> {
    inner: S,
    source: Arc<EngineSource>,
    builder: Option<Arc<dyn IngressResponseBuilder>>,
}

impl<S> Service<Request<Body>> for IngressService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let source = Arc::clone(&self.source);
        let builder = self.builder.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let engine = source.engine().await;
            let attributes = request_attributes(&req);
            let eval = engine.evaluate(&attributes).await;

            let response = match eval.outcome().copied() {
                None => {
                    let response = inner.call(req).await?;
                    match response.extensions().get::<PropagatedTooManyRequests>().cloned() {
                        Some(signal) => {
                            debug!(
                                retry_after = %signal.retry_after,
                                "Translating propagated egress rejection"
                            );
                            propagated_response(&signal)
                        }
                        None => response,
                    }
                }
                Some(exceeded) => {
                    let mut response = limit_response(&exceeded);
                    match builder {
                        None => response,
                        Some(builder) => {
                            match builder.build(&exceeded, &attributes, &mut response).await {
                                IngressDirective::UseResponse => response,
                                IngressDirective::ContinueAsNormal => inner.call(req).await?,
                            }
                        }
                    }
                }
            };

            eval.finish().await;
            Ok(response)
        })
    }
}

fn request_attributes(req: &Request<Body>) -> RequestAttributes {
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let mut attributes = RequestAttributes::new(uri, req.method().as_str());
    attributes.headers = req
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

/// The default rejection: 429 plus a `Retry-After` hint.
pub(crate) fn limit_response(exceeded: &LimitExceeded) -> Response {
    let body = match exceeded.retry_after {
        RetryAfter::Seconds(secs) => format!("Retry after {} seconds", secs.max(1)),
        RetryAfter::At(at) => at.to_string(),
    };
    plain_429(&exceeded.retry_after.to_string(), body)
}

/// A 429 synthesized from a propagated egress signal.
pub(crate) fn propagated_response(signal: &PropagatedTooManyRequests) -> Response {
    let body = match signal.retry_after.parse::<u64>() {
        Ok(secs) => format!("Retry after {secs} seconds"),
        Err(_) => signal.retry_after.clone(),
    };
    plain_429(&signal.retry_after, body)
}

fn plain_429(retry_after: &str, body: String) -> Response {
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::RETRY_AFTER, retry_after)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::TOO_MANY_REQUESTS.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use tower::ServiceExt;

    use crate::clock::ManualClock;
    use crate::limit::RateLimitMethod;
    use crate::loader::ConfigLoader;
    use crate::rules::{Config, Rule};
    use crate::store::MemoryCounterStore;

    fn test_engine(limit: u64, interval: u64) -> Arc<Engine> {
        let config = Config {
            rules: vec![Rule::new(RateLimitMethod::FixedWindow {
                permit_limit: limit,
                interval_secs: interval,
            })],
            whitelist: Vec::new(),
            unique_name: "ingress-test".to_string(),
        };
        Arc::new(Engine::with_clock(
            ConfigLoader::fixed(config),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(ManualClock::new(0)),
        ))
    }

    type InnerFn = fn(Request<Body>) -> BoxFuture<'static, Result<Response, Infallible>>;

    fn ok_handler(_req: Request<Body>) -> BoxFuture<'static, Result<Response, Infallible>> {
        Box::pin(async { Ok(Response::new(Body::from("ok"))) })
    }

    fn ok_service() -> tower::util::ServiceFn<InnerFn> {
        tower::service_fn(ok_handler as InnerFn)
    }

    #[tokio::test]
    async fn second_request_gets_a_retry_after() {
        let layer = IngressLayer::new(test_engine(1, 10));
        let service = layer.layer(ok_service());

        let first = service
            .clone()
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = service
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[header::RETRY_AFTER], "10");
    }

    #[tokio::test]
    async fn propagated_extension_is_translated() {
        let layer = IngressLayer::new(test_engine(100, 10));
        let inner = tower::service_fn(|_req: Request<Body>| async {
            let mut response = Response::new(Body::from("handler output"));
            response.extensions_mut().insert(PropagatedTooManyRequests {
                retry_after: "17".to_string(),
            });
            Ok::<_, Infallible>(response)
        });
        let service = layer.layer(inner);

        let response = service
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "17");
    }

    #[tokio::test]
    async fn builder_can_continue_as_normal() {
        struct AlwaysContinue;

        #[async_trait]
        impl IngressResponseBuilder for AlwaysContinue {
            async fn build(
                &self,
                _outcome: &LimitExceeded,
                _request: &RequestAttributes,
                _response: &mut Response,
            ) -> IngressDirective {
                IngressDirective::ContinueAsNormal
            }
        }

        let layer =
            IngressLayer::new(test_engine(1, 10)).with_response_builder(Arc::new(AlwaysContinue));
        let service = layer.layer(ok_service());

        for _ in 0..5 {
            let response = service
                .clone()
                .oneshot(Request::get("/api").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn builder_can_reshape_the_rejection() {
        struct Teapot;

        #[async_trait]
        impl IngressResponseBuilder for Teapot {
            async fn build(
                &self,
                _outcome: &LimitExceeded,
                _request: &RequestAttributes,
                response: &mut Response,
            ) -> IngressDirective {
                *response.status_mut() = StatusCode::IM_A_TEAPOT;
                IngressDirective::UseResponse
            }
        }

        let layer = IngressLayer::new(test_engine(1, 10)).with_response_builder(Arc::new(Teapot));
        let service = layer.layer(ok_service());

        service
            .clone()
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let second = service
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn lazy_source_builds_the_engine_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let factory: EngineFactory = {
            let built = Arc::clone(&built);
            Arc::new(move || {
                let built = Arc::clone(&built);
                Box::pin(async move {
                    built.fetch_add(1, Ordering::SeqCst);
                    test_engine(100, 10)
                })
            })
        };
        let layer = IngressLayer::lazy(factory);
        let service = layer.layer(ok_service());

        let mut futures = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            futures.push(async move {
                service
                    .oneshot(Request::get("/api").body(Body::empty()).unwrap())
                    .await
                    .unwrap()
                    .status()
            });
        }
        for status in join_all(futures).await {
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn limit_response_formats_both_retry_variants() {
        let relative = limit_response(&LimitExceeded {
            retry_after: RetryAfter::Seconds(9),
        });
        assert_eq!(relative.headers()[header::RETRY_AFTER], "9");

        let absolute = limit_response(&LimitExceeded {
            retry_after: RetryAfter::At(1_700_000_000),
        });
        assert_eq!(absolute.headers()[header::RETRY_AFTER], "1700000000");
    }
}
