//! Fixed-window rate limiting keyed by client identity.
//!
//! # Algorithm
//!
//! Each client key owns a counter and a window end. The first request of a
//! window starts it; every request increments the counter; once the window
//! end passes, the next request starts a fresh window. A request is rejected
//! when the counter exceeds the configured limit.
//!
//! # Configuration
//!
//! `RATE_LIMIT` is `<count>-<unit>` with unit `S`, `M`, `H` or `D`
//! (case-insensitive), e.g. `100-M` for 100 requests per minute.
//!
//! # Response Headers
//!
//! Attached to admitted and rejected responses alike:
//! - `X-RateLimit-Limit`: configured count
//! - `X-RateLimit-Remaining`: requests left in the current window
//! - `X-RateLimit-Reset`: unix time the current window ends
//!
//! # Storage
//!
//! Counters live behind the [`RateStore`] trait. [`MemoryRateStore`] keeps them
//! in a `DashMap`, incrementing under the per-key entry lock so concurrent
//! requests from one client are counted exactly once each.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Request, Response};
use axum::response::IntoResponse;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use tracing::{debug, error, info, trace, warn};

use super::ip::client_key;
use super::{BoxHandler, Middleware};
use crate::config::Config;
use crate::error::GatewayError;

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

// =============================================================================
// Rate
// =============================================================================

/// A request budget: `limit` requests per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub limit: u64,
    pub period: Duration,
}

/// Error type for malformed rate expressions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateParseError {
    #[error("expected <count>-<unit>, got {0:?}")]
    Format(String),

    #[error("count must be a positive integer, got {0:?}")]
    Count(String),

    #[error("unit must be one of S, M, H, D, got {0:?}")]
    Unit(String),
}

impl FromStr for Rate {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| RateParseError::Format(s.to_string()))?;

        let limit = count
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| RateParseError::Count(count.to_string()))?;

        let period = match unit.to_ascii_uppercase().as_str() {
            "S" => Duration::from_secs(1),
            "M" => Duration::from_secs(60),
            "H" => Duration::from_secs(60 * 60),
            "D" => Duration::from_secs(24 * 60 * 60),
            _ => return Err(RateParseError::Unit(unit.to_string())),
        };

        Ok(Self { limit, period })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {:?}", self.limit, self.period)
    }
}

// =============================================================================
// Store
// =============================================================================

/// Outcome of counting one request against a key's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateContext {
    pub limit: u64,
    /// `max(0, limit - count)`
    pub remaining: u64,
    /// Unix seconds at which the current window ends
    pub reset: i64,
    /// `count > limit`
    pub reached: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("rate store unavailable: {0}")]
    Unavailable(String),
}

/// Counter storage shared by every request.
///
/// `increment` must count the request and compare against the limit as one
/// atomic step per key.
#[async_trait]
pub trait RateStore: Send + Sync {
    async fn increment(&self, key: &str, rate: &Rate) -> Result<RateContext, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    ends_at: DateTime<Utc>,
}

/// In-process fixed-window store.
#[derive(Debug, Default)]
pub struct MemoryRateStore {
    windows: DashMap<String, Window>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request for `key` as of `now`.
    fn increment_at(&self, key: &str, rate: &Rate, now: DateTime<Utc>) -> RateContext {
        let period = TimeDelta::from_std(rate.period).unwrap_or(TimeDelta::days(1));

        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            ends_at: now + period,
        });

        if now >= window.ends_at {
            window.count = 0;
            window.ends_at = now + period;
        }
        window.count = window.count.saturating_add(1);

        RateContext {
            limit: rate.limit,
            remaining: rate.limit.saturating_sub(window.count),
            reset: window.ends_at.timestamp(),
            reached: window.count > rate.limit,
        }
    }

    /// Drop windows that ended before `now`. Returns how many were removed.
    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.ends_at > now);
        before.saturating_sub(self.windows.len())
    }

    /// Number of client keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Periodically purge expired windows until `cancellation_token` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        task_tracker: &TaskTracker,
        cancellation_token: CancellationToken,
    ) {
        let store = self;

        task_tracker.spawn(async move {
            let mut ticker = interval(every);
            debug!(interval_secs = every.as_secs(), "Rate store sweeper started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancellation_token.cancelled() => {
                        info!("Rate store sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.sweep_at(Utc::now());
                        trace!(removed, remaining = store.tracked_keys(), "Swept expired rate windows");
                    }
                }
            }

            debug!("Rate store sweeper stopped");
        });
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn increment(&self, key: &str, rate: &Rate) -> Result<RateContext, StoreError> {
        Ok(self.increment_at(key, rate, Utc::now()))
    }
}

// =============================================================================
// Middleware
// =============================================================================

/// Rate limiting stage of the gateway pipeline.
///
/// Enabled when `RATE_LIMIT` is set.
pub struct RateLimiterMiddleware {
    layer: Option<RateLimitLayer>,
}

impl RateLimiterMiddleware {
    pub fn new(layer: Option<RateLimitLayer>) -> Self {
        Self { layer }
    }

    /// Build from configuration, counting into `store`.
    pub fn from_config(config: &Config, store: Arc<dyn RateStore>) -> Self {
        Self::new(config.rate_limit.map(|rate| {
            RateLimitLayer::new(rate, store, config.rate_limit_trust_forward_header)
        }))
    }

    /// A middleware that never participates.
    pub fn disabled() -> Self {
        Self::new(None)
    }
}

impl Middleware for RateLimiterMiddleware {
    fn name(&self) -> &'static str {
        "RateLimiterMiddleware"
    }

    fn enabled(&self) -> bool {
        self.layer.is_some()
    }

    fn handler(&self, next: BoxHandler) -> BoxHandler {
        match &self.layer {
            Some(layer) => BoxCloneSyncService::new(layer.layer(next)),
            None => next,
        }
    }
}

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new("100-M".parse()?, Arc::new(MemoryRateStore::new()), true);
/// let service = layer.layer(inner);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    rate: Rate,
    store: Arc<dyn RateStore>,
    trust_forward_header: bool,
}

impl RateLimitLayer {
    pub fn new(rate: Rate, store: Arc<dyn RateStore>, trust_forward_header: bool) -> Self {
        Self {
            rate,
            store,
            trust_forward_header,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            rate: self.rate,
            store: self.store.clone(),
            trust_forward_header: self.trust_forward_header,
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    rate: Rate,
    store: Arc<dyn RateStore>,
    trust_forward_header: bool,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Owned so the key can move into the async block
        let key = client_key(&req, self.trust_forward_header).into_owned();
        let rate = self.rate;
        let store = self.store.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let context = match store.increment(&key, &rate).await {
                Ok(context) => context,
                Err(e) => {
                    error!(client_key = %key, error = %e, "Rate store increment failed");
                    return Ok(GatewayError::RateStore.into_response());
                }
            };

            let mut response = if context.reached {
                warn!(client_key = %key, limit = context.limit, "Rate limit exceeded");
                GatewayError::RateLimitReached.into_response()
            } else {
                inner.call(req).await?
            };

            insert_rate_headers(response.headers_mut(), &context);
            Ok(response)
        })
    }
}

fn insert_rate_headers(headers: &mut HeaderMap, context: &RateContext) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(context.limit));
    headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(context.remaining),
    );
    headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(context.reset));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn rate(s: &str) -> Rate {
        s.parse().unwrap()
    }

    fn counting_handler(calls: Arc<AtomicUsize>) -> BoxHandler {
        BoxCloneSyncService::new(tower::service_fn(move |_req: Request<Body>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(Body::from("ok")))
            }
        }))
    }

    fn request_from(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    // ==========================================================================
    // Rate parsing
    // ==========================================================================

    #[test]
    fn test_parse_units() {
        assert_eq!(rate("5-S").period, Duration::from_secs(1));
        assert_eq!(rate("10-M").period, Duration::from_secs(60));
        assert_eq!(rate("1000-H").period, Duration::from_secs(3600));
        assert_eq!(rate("7-d").period, Duration::from_secs(86400));
        assert_eq!(rate("10-m").limit, 10);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!("10".parse::<Rate>(), Err(RateParseError::Format(_))));
        assert!(matches!("0-M".parse::<Rate>(), Err(RateParseError::Count(_))));
        assert!(matches!("-5-M".parse::<Rate>(), Err(RateParseError::Count(_))));
        assert!(matches!("x-M".parse::<Rate>(), Err(RateParseError::Count(_))));
        assert!(matches!("10-W".parse::<Rate>(), Err(RateParseError::Unit(_))));
        assert!(matches!("10-".parse::<Rate>(), Err(RateParseError::Unit(_))));
    }

    // ==========================================================================
    // Memory store
    // ==========================================================================

    #[test]
    fn test_window_counts_and_rolls_over() {
        let store = MemoryRateStore::new();
        let rate = rate("2-S");
        let start = Utc::now();

        let first = store.increment_at("a", &rate, start);
        assert_eq!((first.remaining, first.reached), (1, false));

        let second = store.increment_at("a", &rate, start);
        assert_eq!((second.remaining, second.reached), (0, false));

        let third = store.increment_at("a", &rate, start);
        assert_eq!((third.remaining, third.reached), (0, true));
        assert_eq!(third.reset, first.reset);

        let later = start + TimeDelta::seconds(1);
        let fresh = store.increment_at("a", &rate, later);
        assert_eq!((fresh.remaining, fresh.reached), (1, false));
        assert_eq!(fresh.reset, later.timestamp() + 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryRateStore::new();
        let rate = rate("1-M");
        let now = Utc::now();

        assert!(!store.increment_at("a", &rate, now).reached);
        assert!(store.increment_at("a", &rate, now).reached);
        assert!(!store.increment_at("b", &rate, now).reached);
    }

    #[test]
    fn test_sweep_removes_expired_windows() {
        let store = MemoryRateStore::new();
        let now = Utc::now();
        store.increment_at("short", &rate("1-S"), now);
        store.increment_at("long", &rate("1-H"), now);

        let removed = store.sweep_at(now + TimeDelta::seconds(2));

        assert_eq!(removed, 1);
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(MemoryRateStore::new());
        let rate = rate("1000-M");

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("shared", &rate).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let next = store.increment("shared", &rate).await.unwrap();
        assert_eq!(next.remaining, 1000 - 51);
    }

    // ==========================================================================
    // Middleware
    // ==========================================================================

    #[tokio::test]
    async fn test_admits_then_rejects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(rate("10-M"), Arc::new(MemoryRateStore::new()), true);
        let service = layer.layer(counting_handler(calls.clone()));

        let response = service.clone().oneshot(request_from("1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
        assert!(response.headers().contains_key("x-ratelimit-reset"));

        for _ in 0..9 {
            let response = service.clone().oneshot(request_from("1.1.1.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = service.clone().oneshot(request_from("1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["Code"], "RATE_LIMIT_REACH");
        assert_eq!(body["ErrorMessage"], "Rate Limit Reached");

        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_other_clients_unaffected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(rate("1-M"), Arc::new(MemoryRateStore::new()), true);
        let service = layer.layer(counting_handler(calls.clone()));

        service.clone().oneshot(request_from("1.1.1.1")).await.unwrap();
        let blocked = service.clone().oneshot(request_from("1.1.1.1")).await.unwrap();
        let other = service.clone().oneshot(request_from("2.2.2.2")).await.unwrap();

        assert_eq!(blocked.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(other.status(), StatusCode::OK);
    }

    struct FailingStore;

    #[async_trait]
    impl RateStore for FailingStore {
        async fn increment(&self, _key: &str, _rate: &Rate) -> Result<RateContext, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_internal_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(rate("1-M"), Arc::new(FailingStore), true);
        let service = layer.layer(counting_handler(calls.clone()));

        let response = service.oneshot(request_from("1.1.1.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_middleware_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let middleware = RateLimiterMiddleware::disabled();
        assert!(!middleware.enabled());

        let handler = middleware.handler(counting_handler(calls.clone()));
        let response = handler.oneshot(request_from("1.1.1.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }

    #[test]
    fn test_from_config() {
        let store: Arc<dyn RateStore> = Arc::new(MemoryRateStore::new());
        let config = Config {
            rate_limit: Some(rate("5-S")),
            ..Config::default()
        };

        assert!(RateLimiterMiddleware::from_config(&config, store.clone()).enabled());
        assert!(!RateLimiterMiddleware::from_config(&Config::default(), store).enabled());
    }
}
