//! HTTP surface of the gateway.
//!
//! # Layer Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← span per request, records request_id
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← reuses or mints X-Request-Id, forwarded upstream
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ Gateway pipeline │ ← OIDC → JWT → Rate Limiter → Proxy core
//! └──────────────────┘
//! ```
//!
//! There are no routes of its own: every path, including the OIDC callback,
//! is handed to the composed pipeline.

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use tower_http::trace::TraceLayer;
use tracing::{Span, field, info_span};

use crate::middleware::{BoxHandler, RequestIdLayer};

/// Build the router serving everything through `handler`.
pub fn build_router(handler: BoxHandler) -> Router {
    Router::new()
        .fallback_service(handler)
        .layer(RequestIdLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(make_span))
}

fn make_span(req: &Request<Body>) -> Span {
    info_span!(
        "request",
        method = %req.method(),
        uri = %req.uri(),
        request_id = field::Empty,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use axum::http::{Response, StatusCode};
    use tower::util::BoxCloneSyncService;
    use tower::{ServiceExt, service_fn};

    fn echo_path() -> BoxHandler {
        BoxCloneSyncService::new(service_fn(|req: Request<Body>| async move {
            Ok::<_, Infallible>(Response::new(Body::from(req.uri().path().to_string())))
        }))
    }

    #[tokio::test]
    async fn test_every_path_reaches_handler() {
        let router = build_router(echo_path());

        for path in ["/", "/deep/nested/path", "/_/oidc/callback"] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().contains_key("x-request-id"));
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(&body[..], path.as_bytes());
        }
    }
}
