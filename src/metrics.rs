//! Prometheus metrics for the gateway.
//!
//! Uses the `metrics` facade with a Prometheus recorder. Unlike a sidecar
//! exporter, the rendered exposition is served from the gateway's own
//! `GET /metrics` route so the reserved surface stays on one listener.
//!
//! # Available Metrics
//!
//! - `gateway_requests_total` - requests that reached the rate-limit stage
//! - `gateway_rate_limited_total` - requests denied by the limiter
//! - `gateway_cache_hits_total` / `gateway_cache_misses_total`
//! - `gateway_circuit_opens_total` / `gateway_circuit_rejections_total`
//!   (labelled by target)
//! - `gateway_upstream_errors_total`
//! - `gateway_proxy_duration_seconds` - origin round-trip latency

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::error;

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const CACHE_HITS_TOTAL: &str = "gateway_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "gateway_cache_misses_total";
    pub const CIRCUIT_OPENS_TOTAL: &str = "gateway_circuit_opens_total";
    pub const CIRCUIT_REJECTIONS_TOTAL: &str = "gateway_circuit_rejections_total";
    pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";
    pub const PROXY_DURATION_SECONDS: &str = "gateway_proxy_duration_seconds";
}

/// Install the Prometheus recorder and return its render handle.
///
/// Installation fails when a recorder is already registered (e.g. a second
/// gateway instance in one test process); that is logged and metrics are
/// simply not exported, the gateway itself keeps working.
pub fn try_install() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_metrics();
            Some(handle)
        }
        Err(e) => {
            error!(error = %e, "failed to install Prometheus recorder, metrics disabled");
            None
        }
    }
}

fn describe_metrics() {
    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total requests that reached the rate-limit stage"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total requests denied by the rate limiter"
    );
    describe_counter!(names::CACHE_HITS_TOTAL, "Total response cache hits");
    describe_counter!(names::CACHE_MISSES_TOTAL, "Total response cache misses");
    describe_counter!(
        names::CIRCUIT_OPENS_TOTAL,
        "Total circuit breaker open transitions"
    );
    describe_counter!(
        names::CIRCUIT_REJECTIONS_TOTAL,
        "Total calls rejected by an open circuit breaker"
    );
    describe_counter!(
        names::UPSTREAM_ERRORS_TOTAL,
        "Total upstream transport failures"
    );
    describe_histogram!(
        names::PROXY_DURATION_SECONDS,
        "Origin round-trip duration in seconds"
    );
}

pub fn record_request() {
    counter!(names::REQUESTS_TOTAL).increment(1);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_breaker_open(target: &str) {
    counter!(names::CIRCUIT_OPENS_TOTAL, "target" => target.to_string()).increment(1);
}

pub fn record_breaker_rejection(target: &str) {
    counter!(names::CIRCUIT_REJECTIONS_TOTAL, "target" => target.to_string()).increment(1);
}

pub fn record_upstream_error() {
    counter!(names::UPSTREAM_ERRORS_TOTAL).increment(1);
}

pub fn record_proxy_duration(duration_secs: f64) {
    histogram!(names::PROXY_DURATION_SECONDS).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The recording functions must be safe to call with no recorder
    // installed; they become no-ops through the metrics facade.

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_request();
        record_rate_limited();
        record_cache_hit();
        record_cache_miss();
        record_breaker_open("origin");
        record_breaker_rejection("origin");
        record_upstream_error();
        record_proxy_duration(0.05);
    }
}
