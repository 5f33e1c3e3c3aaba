//! Middleware chain
//!
//! A listener's handler is the shared router wrapped by an ordered list of
//! [`Middleware`] values. The list is folded front to back, so the first
//! entry ends up innermost and the last entry runs first:
//!
//! ```text
//! [Minter, Edge, NoCache, AccessLog]  =>  AccessLog(NoCache(Edge(Minter(router))))
//! ```
//!
//! Stages that read an identity must therefore come *before* the stage that
//! publishes it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderValue, Request, Response, header},
};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::{MakeSpan, OnResponse, TraceLayer},
};
use tracing::{Span, field::Empty, info};
use uuid::Uuid;

use crate::{Error, Result};

/// A request-handler decorator.
pub trait Middleware: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Wrap `router`, returning the decorated router.
    fn wrap(self: Arc<Self>, router: Router) -> Router;
}

/// Fold `middlewares` around `router`; the last one runs first.
pub fn apply_chain(router: Router, middlewares: &[Arc<dyn Middleware>]) -> Router {
    middlewares
        .iter()
        .fold(router, |router, middleware| Arc::clone(middleware).wrap(router))
}

/// Names of `middlewares` in execution order (outermost first)
#[must_use]
pub fn execution_order(middlewares: &[Arc<dyn Middleware>]) -> Vec<&'static str> {
    middlewares.iter().rev().map(|m| m.name()).collect()
}

// ── Response headers ──────────────────────────────────────────────────────

/// Sets `Cache-Control: no-cache` on every response.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl Middleware for NoCache {
    fn name(&self) -> &'static str {
        "no-cache"
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
    }
}

/// Sets a fixed `Content-Security-Policy` on every response.
#[derive(Debug, Clone)]
pub struct ContentSecurityPolicy {
    policy: HeaderValue,
}

impl ContentSecurityPolicy {
    /// Create the middleware; fails if `policy` is not a valid header value.
    pub fn new(policy: &str) -> Result<Self> {
        let policy = HeaderValue::from_str(policy)
            .map_err(|e| Error::config(format!("invalid CSP_POLICY: {e}")))?;
        Ok(Self { policy })
    }
}

impl Middleware for ContentSecurityPolicy {
    fn name(&self) -> &'static str {
        "csp"
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            self.policy.clone(),
        ))
    }
}

/// gzip response compression, negotiated via `Accept-Encoding`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compression;

impl Middleware for Compression {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(CompressionLayer::new())
    }
}

// ── Access log ────────────────────────────────────────────────────────────

/// Opens the `request` span every other stage records into and emits one
/// `access` event per response.
///
/// Requests without `X-Request-Id` get a fresh UUID v4, which is also
/// forwarded upstream and echoed on the response.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLog;

impl Middleware for AccessLog {
    fn name(&self) -> &'static str {
        "access-log"
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(RequestIdGenerator))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(RequestSpan)
                        .on_request(())
                        .on_response(LogAccess)
                        .on_failure(()),
                )
                .layer(CatchPanicLayer::new()),
        )
    }
}

/// Generates `X-Request-Id` values
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdGenerator;

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = %request_id,
            email = Empty,
            dev_email = Empty,
            basic_auth_username = Empty,
            subject = Empty,
            error_message = Empty,
            stage = Empty,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct LogAccess;

impl<B> OnResponse<B> for LogAccess {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let encoding = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        info!(
            parent: span,
            status = response.status().as_u16(),
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            encoding,
            "access"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get};
    use tower::ServiceExt;

    #[derive(Debug)]
    struct Named(&'static str);

    impl Middleware for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn wrap(self: Arc<Self>, router: Router) -> Router {
            router
        }
    }

    #[test]
    fn last_middleware_runs_first() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Named("inner")), Arc::new(Named("outer"))];
        assert_eq!(execution_order(&chain), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn header_middlewares_set_response_headers() {
        // GIVEN: a router wrapped with no-cache and CSP
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(NoCache),
            Arc::new(ContentSecurityPolicy::new("default-src 'self'").unwrap()),
        ];
        let app = apply_chain(Router::new().route("/", get(|| async { "ok" })), &chain);

        // WHEN: a request is served
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // THEN: both headers are present
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(
            response.headers()[header::CONTENT_SECURITY_POLICY],
            "default-src 'self'"
        );
    }

    #[test]
    fn invalid_csp_is_config_error() {
        assert!(ContentSecurityPolicy::new("bad\nvalue").is_err());
    }

    #[tokio::test]
    async fn access_log_assigns_request_id() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(AccessLog)];
        let app = apply_chain(Router::new().route("/", get(|| async { "ok" })), &chain);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn access_log_keeps_existing_request_id() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(AccessLog)];
        let app = apply_chain(
            Router::new().route(
                "/",
                get(|headers: axum::http::HeaderMap| async move {
                    headers["x-request-id"].to_str().unwrap().to_string()
                }),
            ),
            &chain,
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }
}
