use chrono::{DateTime, Utc};
use serde::Serialize;

/// Liveness probe response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "healthy" when the process can answer
    pub status: String,
    /// Crate version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

/// State of one circuit breaker.
#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    /// "closed", "open" or "half-open"
    pub state: String,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    /// Failures inside the monitor window
    pub recent_failures: usize,
    pub times_opened: u32,
    pub requests_rejected: u64,
}

/// Readiness probe response.
///
/// `ready` is false while any breaker is open: the rate limiter fails closed
/// in that state, so the instance would reject most traffic with 503s.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    /// "distributed" or "in_process"
    pub limiter_mode: String,
    /// Counting backend ("redis", "memory", "governor")
    pub limiter_backend: String,
    pub breakers: Vec<BreakerStatus>,
}

/// Body returned by the echo handler for admitted requests.
#[derive(Debug, Serialize)]
pub struct AdmittedResponse {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub user_id: String,
    pub roles: Vec<String>,
    /// Remaining points in the current rate-limit window, if a limiter ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining: Option<u32>,
    /// Size of the admitted request body in bytes
    pub body_bytes: usize,
    /// Parsed JSON body, when one was sent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}
