//! Assembly of the middleware pipeline in front of the proxy core.
//!
//! # Composition
//!
//! For middleware `[m1, m2, m3]` the composed handler runs
//! `m1 → m2 → m3 → core`. Disabled middleware contributes nothing to the
//! chain. The default order is OIDC, JWT, then the rate limiter, so the rate
//! limiter only counts requests that already passed authentication.
//!
//! # Lifecycle
//!
//! [`build_gateway`] discovers the OIDC provider (when enabled) before any
//! request is served and spawns the rate store sweeper. [`Gateway::shutdown`]
//! stops the sweeper and waits for it.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::util::BoxCloneSyncService;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::StartupError;
use crate::metrics;
use crate::middleware::{
    BoxHandler, JwtMiddleware, MemoryRateStore, Middleware, OidcMiddleware, OidcSettings,
    RateLimiterMiddleware,
};
use crate::oidc::DiscoveredProvider;
use crate::proxy::ProxyCore;
use crate::routes::build_router;
use crate::session::SealedCookieCodec;

/// Bounds on how often expired rate windows are purged.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Ordered list of middleware wrapped around a core handler.
#[derive(Default)]
pub struct GatewayComposer {
    middleware: Vec<Box<dyn Middleware>>,
}

impl GatewayComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `middleware`; it runs after everything added before it.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(middleware));
        self
    }

    /// Names of the middleware that take part in the chain, in run order.
    pub fn enabled(&self) -> Vec<&'static str> {
        self.middleware
            .iter()
            .filter(|m| m.enabled())
            .map(|m| m.name())
            .collect()
    }

    /// Wrap `core` so every enabled middleware runs before it, in order.
    pub fn compose(&self, core: BoxHandler) -> BoxHandler {
        for m in &self.middleware {
            metrics::set_middleware_enabled(m.name(), m.enabled());
        }
        info!(middleware = ?self.enabled(), "Gateway pipeline composed");

        // Innermost first, so the first declared middleware ends up outermost
        self.middleware
            .iter()
            .rev()
            .filter(|m| m.enabled())
            .fold(core, |next, m| m.handler(next))
    }
}

/// The composed request handler and the background tasks it depends on.
pub struct Gateway {
    handler: BoxHandler,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl Gateway {
    /// The composed handler, for driving the pipeline without a router.
    pub fn handler(&self) -> BoxHandler {
        self.handler.clone()
    }

    /// Router serving every path through the gateway.
    pub fn router(&self) -> Router {
        build_router(self.handler())
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }
}

/// Build the gateway described by `config`.
///
/// # Errors
///
/// Returns `StartupError::Discovery` if OIDC is enabled and the provider
/// cannot be discovered.
pub async fn build_gateway(config: &Config) -> Result<Gateway, StartupError> {
    let task_tracker = TaskTracker::new();
    let cancellation_token = CancellationToken::new();

    let oidc = if config.oidc.enabled() {
        let provider = DiscoveredProvider::discover(&config.oidc).await?;
        let codec = SealedCookieCodec::new(&config.oidc.session_secret, &config.oidc.cookie_name)
            .secure(config.oidc.secure_cookies())
            .max_age_secs(config.oidc.session_ttl.map(|ttl| ttl.as_secs()));

        if config.oidc.session_ttl.is_none() {
            warn!("ODIC_SESSION_TTL_SECS is 0, OIDC sessions never expire");
        }

        OidcMiddleware::new(
            Arc::new(provider),
            Arc::new(codec),
            OidcSettings::from_config(&config.oidc),
        )
    } else {
        OidcMiddleware::disabled()
    };

    let rate_limiter = match &config.rate_limit {
        Some(rate) => {
            let store = Arc::new(MemoryRateStore::new());
            let every = rate.period.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
            store
                .clone()
                .spawn_sweeper(every, &task_tracker, cancellation_token.clone());

            info!(rate = %rate, "Rate limit configured");
            RateLimiterMiddleware::from_config(config, store)
        }
        None => RateLimiterMiddleware::disabled(),
    };

    let composer = GatewayComposer::new()
        .with(oidc)
        .with(JwtMiddleware::new(config.jwt_secret.as_deref()))
        .with(rate_limiter);

    let core = ProxyCore::from_config(config);
    info!(upstream = %config.upstream, "Upstream configured");

    Ok(Gateway {
        handler: composer.compose(BoxCloneSyncService::new(core)),
        task_tracker,
        cancellation_token,
    })
}
