mod api;

pub use api::{AdmittedResponse, BreakerStatus, HealthResponse, ReadinessResponse};
