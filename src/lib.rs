//! # Auth Proxy
//!
//! An authenticating reverse-proxy gateway. Every request passes through a
//! pipeline of independently enabled middleware before it is forwarded to a
//! single upstream:
//!
//! - **OIDC**: browser login through the authorization-code flow, with the
//!   session sealed in a cookie
//! - **JWT**: bearer tokens signed with a shared HMAC secret
//! - **Rate limiting**: fixed-window request budget per client
//!
//! The authenticated identity is forwarded to the upstream in a header, and
//! request/response headers can be rewritten from configuration.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Trace → Request ID                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  GatewayComposer (OIDC → JWT → Rate Limiter)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ProxyCore (RewritePipeline + pooled hyper client)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Upstream service (HTTP)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use auth_proxy::{Config, build_gateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let gateway = build_gateway(&config).await?;
//!     let app = gateway.router();
//!
//!     // Serve `app` with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Enabling Middleware
//!
//! ```bash
//! UPSTREAM=http://localhost:8000 JWT_SECRET=changeme RATE_LIMIT=100-M cargo run
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod oidc;
pub mod proxy;
pub mod routes;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{ConfigError, GatewayError, GatewayResult, StartupError};
pub use gateway::{Gateway, GatewayComposer, build_gateway};
pub use identity::{Subject, SubjectExt};
pub use routes::build_router;
