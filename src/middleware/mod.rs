//! Gateway middleware and the pipeline contract they share.
//!
//! Every policy the gateway enforces is a [`Middleware`]: it decides once at
//! construction whether it is enabled, and when asked wraps the next handler
//! in the chain with its own checks. The concrete middleware are also plain
//! tower `Layer`s, so they can be stacked onto any service in tests.
//!
//! # Pipeline
//!
//! ```text
//! Request → OIDC → JWT → Rate Limiter → Proxy core → Upstream
//!             ↓      ↓          ↓
//!           307/400 401        401 + X-RateLimit-*
//! ```
//!
//! Supporting layers that sit outside the pipeline:
//!
//! - **Request ID**: generation and propagation of `X-Request-Id`
//! - **Client IP**: forwarded-header aware client identification

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{Request, Response};
use tower::util::BoxCloneSyncService;

pub mod ip;
pub mod jwt;
pub mod oidc;
pub mod rate_limit;
pub mod request_id;

pub use ip::{UNKNOWN_IP, client_key, peer_ip};
pub use jwt::{JwtLayer, JwtMiddleware};
pub use oidc::{OidcLayer, OidcMiddleware, OidcSettings};
pub use rate_limit::{
    MemoryRateStore, Rate, RateContext, RateLimitLayer, RateLimiterMiddleware, RateStore,
    StoreError,
};
pub use request_id::RequestIdLayer;

/// Type-erased request handler every middleware wraps and returns.
///
/// Errors never escape a handler: rejections are rendered as responses.
pub type BoxHandler = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

/// A conditionally enabled stage of the gateway pipeline.
pub trait Middleware: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Whether the middleware takes part in the pipeline.
    ///
    /// Fixed at construction from configuration.
    fn enabled(&self) -> bool;

    /// Wrap `next` so this middleware runs before it.
    ///
    /// A disabled middleware returns `next` unchanged.
    fn handler(&self, next: BoxHandler) -> BoxHandler;
}
