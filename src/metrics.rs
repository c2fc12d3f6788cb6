//! Lightweight metrics helpers for Conflux.
//!
//! This module exposes a small set of convenience functions wrapping the
//! `metrics` crate macros. It intentionally avoids embedding a concrete
//! exporter (the application can initialize any compatible recorder
//! externally) while still documenting Conflux-specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `conflux_requests_total` (counter)
//! * `conflux_request_duration_seconds` (histogram)
//! * `conflux_backend_requests_total` (counter)
//! * `conflux_backend_request_duration_seconds` (histogram)
//! * `conflux_active_requests` (gauge)
//! * `conflux_route_table_reloads_total` (counter)
//!
//! The `mw-metrics` middleware block gates which layers emit:
//! `router_enabled`, `proxy_enabled` and `backend_enabled` all default to on.
use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

use crate::config::models::MwConfig;

pub const CONFLUX_REQUESTS_TOTAL: &str = "conflux_requests_total";
pub const CONFLUX_REQUEST_DURATION_SECONDS: &str = "conflux_request_duration_seconds";
pub const CONFLUX_BACKEND_REQUESTS_TOTAL: &str = "conflux_backend_requests_total";
pub const CONFLUX_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "conflux_backend_request_duration_seconds";
pub const CONFLUX_ACTIVE_REQUESTS: &str = "conflux_active_requests";
pub const CONFLUX_ROUTE_TABLE_RELOADS_TOTAL: &str = "conflux_route_table_reloads_total";

/// Middleware namespace gating metric emission per layer.
pub const METRICS_MW_NAMESPACE: &str = "mw-metrics";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        CONFLUX_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        CONFLUX_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        CONFLUX_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests forwarded to backend services."
    );
    describe_histogram!(
        CONFLUX_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests forwarded to backend services."
    );
    describe_gauge!(
        CONFLUX_ACTIVE_REQUESTS,
        "Number of requests currently in flight."
    );
    describe_counter!(
        CONFLUX_ROUTE_TABLE_RELOADS_TOTAL,
        Unit::Count,
        "Route table snapshots published by the reload supervisor."
    );
});

/// Register metric descriptions once.
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

/// Which layers emit metrics, read from the `mw-metrics` middleware block.
#[derive(Debug, Clone, Copy)]
pub struct MetricsFlags {
    pub router_enabled: bool,
    pub proxy_enabled: bool,
    pub backend_enabled: bool,
}

impl Default for MetricsFlags {
    fn default() -> Self {
        Self {
            router_enabled: true,
            proxy_enabled: true,
            backend_enabled: true,
        }
    }
}

impl MetricsFlags {
    pub fn from_middleware(middleware: &MwConfig) -> Self {
        let defaults = Self::default();
        let Some(mw) = middleware.get(METRICS_MW_NAMESPACE) else {
            return defaults;
        };
        let read = |key: &str, fallback: bool| mw.get(key).and_then(|v| v.as_bool()).unwrap_or(fallback);
        Self {
            router_enabled: read("router_enabled", defaults.router_enabled),
            proxy_enabled: read("proxy_enabled", defaults.proxy_enabled),
            backend_enabled: read("backend_enabled", defaults.backend_enabled),
        }
    }
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(endpoint: &str, method: &str, status: u16) {
    counter!(
        CONFLUX_REQUESTS_TOTAL,
        "endpoint" => endpoint.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(endpoint: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        CONFLUX_REQUEST_DURATION_SECONDS,
        "endpoint" => endpoint.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment total count of proxied backend requests.
pub fn increment_backend_request_total(backend: &str, path: &str, method: &str, status: u16) {
    counter!(
        CONFLUX_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed backend call's duration.
pub fn record_backend_request_duration(backend: &str, path: &str, duration: std::time::Duration) {
    histogram!(
        CONFLUX_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "path" => path.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Track the in-flight request gauge.
pub fn adjust_active_requests(delta: i64) {
    gauge!(CONFLUX_ACTIVE_REQUESTS).increment(delta as f64);
}

/// Count a published route-table snapshot.
pub fn increment_route_table_reloads() {
    counter!(CONFLUX_ROUTE_TABLE_RELOADS_TOTAL).increment(1);
}
