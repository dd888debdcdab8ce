//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness, always 200 while the process answers
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! Both bypass the admission pipeline so probes are never rate limited.
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 with version and uptime
//! - **Readiness** (`/ready`): Returns 503 while any circuit breaker is open,
//!   because the rate limiter fails closed and most requests would be denied

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::{BreakerStatus, HealthResponse, ReadinessResponse};
use crate::state::AppState;

/// Liveness endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// # Usage
///
/// Configure in Kubernetes:
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 3000
///   initialDelaySeconds: 5
///   periodSeconds: 10
/// ```
#[instrument(skip(state))]
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let breakers: Vec<BreakerStatus> = state
        .breakers
        .breakers()
        .iter()
        .map(|breaker| BreakerStatus {
            name: breaker.name().to_string(),
            state: breaker.state().to_string(),
            failure_count: breaker.failure_count(),
            recent_failures: breaker.recent_failures(),
            times_opened: breaker.times_opened(),
            requests_rejected: breaker.requests_rejected(),
        })
        .collect();

    let ready = !state.breakers.any_open();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            limiter_mode: state.limiter.mode().to_string(),
            limiter_backend: state.limiter.backend().to_string(),
            breakers,
        }),
    )
}
