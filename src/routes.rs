//! Application routing.
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!    ┌─────┴──────────────────────────┐
//!    ▼                                ▼
//! /health, /ready              every other route
//! (probes, no pipeline)               │
//!                                     ▼
//!                          ┌──────────────────────┐
//!                          │  Admission pipeline  │ ← CORS → HTTPS → Rate Limit →
//!                          └──────────┬───────────┘   Content-Type → Auth → CSRF
//!                                     ▼
//!                              Business handler
//! ```
//!
//! The pipeline owns body buffering and its size limit, so no
//! `DefaultBodyLimit` layer is applied here.

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the application router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// the pipeline can see the socket peer for rate-limit keys.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .fallback(admit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Hand the request to the admission pipeline.
async fn admit(State(state): State<AppState>, request: Request) -> Response {
    state.pipeline.handle(request).await
}
