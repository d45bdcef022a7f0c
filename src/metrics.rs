//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`,
//! disabled with `METRICS_PORT=0`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_rejections_total` - Requests rejected by the gateway (labels: code)
//! - `gateway_upstream_responses_total` - Upstream responses relayed (labels: status)
//! - `gateway_upstream_failures_total` - Upstream exchanges that failed (labels: kind)
//!
//! ## Histograms
//! - `gateway_upstream_duration_seconds` - Time to the upstream response head
//!
//! ## Gauges
//! - `gateway_middleware_enabled` - 1 for each enabled middleware (labels: middleware)
//!
//! Recording functions are no-ops until [`init_metrics`] installs the exporter,
//! so library code and tests can call them freely.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REJECTIONS_TOTAL: &str = "gateway_rejections_total";
    pub const UPSTREAM_RESPONSES_TOTAL: &str = "gateway_upstream_responses_total";
    pub const UPSTREAM_FAILURES_TOTAL: &str = "gateway_upstream_failures_total";
    pub const UPSTREAM_DURATION_SECONDS: &str = "gateway_upstream_duration_seconds";
    pub const MIDDLEWARE_ENABLED: &str = "gateway_middleware_enabled";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed, for example when
/// the address is already in use.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REJECTIONS_TOTAL,
        "Total number of requests rejected by the gateway"
    );
    describe_counter!(
        names::UPSTREAM_RESPONSES_TOTAL,
        "Total number of upstream responses relayed to clients"
    );
    describe_counter!(
        names::UPSTREAM_FAILURES_TOTAL,
        "Total number of upstream exchanges that failed or timed out"
    );
    describe_histogram!(
        names::UPSTREAM_DURATION_SECONDS,
        "Time until the upstream response head arrived, in seconds"
    );
    describe_gauge!(
        names::MIDDLEWARE_ENABLED,
        "Whether a middleware is part of the pipeline (1 = enabled)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record a rejected request by its machine code.
pub fn record_rejection(code: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "code" => code).increment(1);
}

/// Record a relayed upstream response and its latency.
pub fn record_upstream_response(status: u16, duration_secs: f64) {
    counter!(names::UPSTREAM_RESPONSES_TOTAL, "status" => status.to_string()).increment(1);
    histogram!(names::UPSTREAM_DURATION_SECONDS).record(duration_secs);
}

/// Record a failed upstream exchange (`unavailable` or `timeout`).
pub fn record_upstream_failure(kind: &'static str) {
    counter!(names::UPSTREAM_FAILURES_TOTAL, "kind" => kind).increment(1);
}

/// Publish whether a middleware is part of the composed pipeline.
pub fn set_middleware_enabled(middleware: &'static str, enabled: bool) {
    gauge!(names::MIDDLEWARE_ENABLED, "middleware" => middleware).set(if enabled {
        1.0
    } else {
        0.0
    });
}
