//! # Admission Gate
//!
//! A request-admission pipeline for CRUD APIs built on Axum. Every request
//! passes an ordered chain of guards before a business handler sees it:
//!
//! - **Origin and transport**: CORS preflight handling, HTTPS enforcement
//! - **Abuse prevention**: distributed rate limiting that fails closed when
//!   its shared store is unreachable, guarded by a circuit breaker
//! - **Request hygiene**: content-type validation, bounded body buffering
//! - **Identity**: bearer authentication with failed-auth penalties,
//!   role/permission authorization, CSRF double-submit verification
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Probes (/health, /ready)  │  Pipeline (fallback route)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Stages: CORS → HTTPS → RateLimit → ContentType → Auth →    │
//! │          Authorize → CSRF → BusinessHandler                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimiter ─► CircuitBreaker ─► CounterStore (Redis)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use admission_gate::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::connect(config).await?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Single-instance mode
//!
//! Without Redis the limiter can run on process-local counters. Limits are
//! then per instance:
//! ```bash
//! DISTRIBUTED_STORE_ENABLED=false cargo run
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod csrf;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use pipeline::{Pipeline, Stage};
pub use routes::build_router;
pub use state::{AppState, Collaborators};
