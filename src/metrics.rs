//! Prometheus metrics for the admission pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener (default port 9090).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `admission_requests_total` - Requests leaving the pipeline (label: status)
//! - `admission_rate_limit_decisions_total` - Limiter decisions (labels: profile, outcome)
//! - `admission_penalties_total` - Failed-auth penalties (label: outcome)
//! - `admission_csrf_failures_total` - CSRF rejections (label: code)
//! - `admission_pipeline_faults_total` - Faults caught by the composer
//! - `admission_circuit_breaker_opens_total` - Times a breaker opened (label: breaker)
//! - `admission_circuit_breaker_rejections_total` - Calls rejected by a breaker (label: breaker)
//!
//! ## Histograms
//! - `admission_request_duration_seconds` - Pipeline duration (labels: method, status)
//!
//! ## Gauges
//! - `admission_circuit_breaker_state` - Breaker state (0 = closed, 1 = half-open, 2 = open)
//!
//! Recording functions are safe to call before (or without) installing the
//! exporter; they become no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "admission_requests_total";
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "admission_rate_limit_decisions_total";
    pub const PENALTIES_TOTAL: &str = "admission_penalties_total";
    pub const CSRF_FAILURES_TOTAL: &str = "admission_csrf_failures_total";
    pub const PIPELINE_FAULTS_TOTAL: &str = "admission_pipeline_faults_total";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "admission_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str =
        "admission_circuit_breaker_rejections_total";
    pub const REQUEST_DURATION_SECONDS: &str = "admission_request_duration_seconds";
    pub const CIRCUIT_BREAKER_STATE: &str = "admission_circuit_breaker_state";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (e.g. port in use).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests that left the admission pipeline"
    );
    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Rate limiter decisions by profile and outcome"
    );
    describe_counter!(
        names::PENALTIES_TOTAL,
        "Failed-authentication penalty attempts by outcome"
    );
    describe_counter!(
        names::CSRF_FAILURES_TOTAL,
        "CSRF double-submit rejections by failure code"
    );
    describe_counter!(
        names::PIPELINE_FAULTS_TOTAL,
        "Unhandled faults converted to 500 by the pipeline"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times a circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Calls rejected by an open or saturated circuit breaker"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Time spent in the admission pipeline in seconds"
    );
    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
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

// =============================================================================
// Counters
// =============================================================================

/// Record a request leaving the pipeline.
pub fn record_request(status: u16) {
    counter!(names::REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record a rate limiter decision.
pub fn record_rate_limit_decision(profile: &'static str, outcome: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "profile" => profile, "outcome" => outcome)
        .increment(1);
}

/// Record a failed-auth penalty attempt (`applied`, `fallback`, `dropped`).
pub fn record_penalty(outcome: &'static str) {
    counter!(names::PENALTIES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a CSRF rejection.
pub fn record_csrf_failure(code: &'static str) {
    counter!(names::CSRF_FAILURES_TOTAL, "code" => code).increment(1);
}

/// Record a fault caught by the composer.
pub fn record_pipeline_fault() {
    counter!(names::PIPELINE_FAULTS_TOTAL).increment(1);
}

/// Record circuit breaker opening.
pub fn record_circuit_breaker_open(breaker: &str) {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL, "breaker" => breaker.to_string()).increment(1);
}

/// Record circuit breaker rejection.
pub fn record_circuit_breaker_rejection(breaker: &str) {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL, "breaker" => breaker.to_string())
        .increment(1);
}

// =============================================================================
// Histograms & Gauges
// =============================================================================

/// Record time spent in the pipeline.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

/// Update circuit breaker state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(breaker: &str, state: u8) {
    gauge!(names::CIRCUIT_BREAKER_STATE, "breaker" => breaker.to_string()).set(f64::from(state));
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recording without an installed exporter must not panic.

    #[test]
    fn test_record_counters_without_exporter() {
        record_request(200);
        record_rate_limit_decision("api", "allowed");
        record_penalty("applied");
        record_csrf_failure("CSRF_TOKEN_MISMATCH");
        record_pipeline_fault();
        record_circuit_breaker_open("redis");
        record_circuit_breaker_rejection("redis");
    }

    #[test]
    fn test_record_duration_and_gauge() {
        record_request_duration("POST", 201, 0.01);
        set_circuit_breaker_state("redis", 0);
        set_circuit_breaker_state("redis", 2);
    }
}
