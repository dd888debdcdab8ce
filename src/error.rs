use axum::http::header::{RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::csrf::CsrfFailure;

/// Admission and application error types with their HTTP status codes.
///
/// # Taxonomy
///
/// - Validation: `Validation`, `SerializationError` (400),
///   `UnsupportedMediaType` (415), `PayloadTooLarge` (413)
/// - Authentication: `Unauthorized` (401)
/// - Authorization: `Forbidden`, `HttpsRequired` (403)
/// - `RateLimited` (429) is a normal denial; `ServiceUnavailable` (503)
///   means the limiter failed closed because its store is unreachable
/// - `Csrf` (403, or 401 when no identity was established)
/// - `Internal` (500) carries only the request id back to the client
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unsupported content type: expected {expected}, received {received:?}")]
    UnsupportedMediaType {
        expected: &'static str,
        received: Option<String>,
    },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("HTTPS is required")]
    HttpsRequired { upgrade_url: Option<String> },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Service unavailable, retry after {retry_after_secs}s")]
    ServiceUnavailable { retry_after_secs: u64 },

    #[error("CSRF verification failed: {0}")]
    Csrf(CsrfFailure),

    #[error("Internal server error (request {request_id})")]
    Internal { request_id: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::SerializationError(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::HttpsRequired { .. } => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Csrf(failure) => failure.status_code(),
            AppError::Internal { .. } | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> ErrorResponse {
        let (error, message, code, details) = match self {
            AppError::Validation(msg) => ("validation_error", msg.clone(), None, None),
            AppError::SerializationError(e) => {
                ("serialization_error", sanitize_serde_error(e), None, None)
            }
            AppError::UnsupportedMediaType { expected, received } => (
                "unsupported_media_type",
                format!("Content-Type must be {expected}"),
                None,
                Some(json!({ "expected": expected, "received": received })),
            ),
            AppError::PayloadTooLarge { limit } => (
                "payload_too_large",
                "Request body is too large".to_string(),
                None,
                Some(json!({ "limit_bytes": limit })),
            ),
            AppError::Unauthorized(msg) => ("unauthorized", msg.clone(), None, None),
            AppError::Forbidden(msg) => ("forbidden", msg.clone(), None, None),
            AppError::HttpsRequired { upgrade_url } => (
                "https_required",
                "This endpoint must be accessed over HTTPS".to_string(),
                None,
                upgrade_url
                    .as_ref()
                    .map(|url| json!({ "upgrade_url": url })),
            ),
            AppError::RateLimited { retry_after_secs } => (
                "rate_limit_exceeded",
                "Too many requests. Please retry later.".to_string(),
                None,
                Some(json!({ "retry_after": retry_after_secs })),
            ),
            AppError::ServiceUnavailable { retry_after_secs } => (
                "service_unavailable",
                "Service is temporarily unavailable. Please retry later.".to_string(),
                None,
                Some(json!({ "retry_after": retry_after_secs })),
            ),
            AppError::Csrf(failure) => (
                "csrf_failure",
                failure.to_string(),
                Some(failure.code()),
                None,
            ),
            // Never expose internal details to clients
            AppError::Internal { request_id } => (
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
                None,
                Some(json!({ "request_id": request_id })),
            ),
            AppError::ConfigError(_) => (
                "config_error",
                "Service configuration error. Please contact support.".to_string(),
                None,
                None,
            ),
        };

        ErrorResponse {
            error,
            message,
            code,
            details,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut response = (status, axum::Json(self.body())).into_response();
        let headers = response.headers_mut();
        match &self {
            AppError::RateLimited { retry_after_secs }
            | AppError::ServiceUnavailable { retry_after_secs } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            AppError::Unauthorized(_) => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }
        response
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    let backticked = || {
        let start = msg.find('`')?;
        let rest = msg.get(start + 1..)?;
        let end = rest.find('`')?;
        rest.get(..end)
    };

    if msg.contains("missing field")
        && let Some(field) = backticked()
    {
        return format!("Missing required field: {field}");
    }

    if msg.contains("unknown field")
        && let Some(field) = backticked()
    {
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = AppError::RateLimited {
            retry_after_secs: 60,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "60");
        let body = body_json(response).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_service_unavailable_is_distinct_from_rate_limited() {
        let response = AppError::ServiceUnavailable {
            retry_after_secs: 60,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "60");
        assert_eq!(body_json(response).await["error"], "service_unavailable");
    }

    #[tokio::test]
    async fn test_internal_error_only_exposes_request_id() {
        let response = AppError::Internal {
            request_id: "req-123".into(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["details"]["request_id"], "req-123");
        assert!(!body.to_string().contains("panic"));
    }

    #[tokio::test]
    async fn test_csrf_failure_carries_code() {
        let response = AppError::Csrf(CsrfFailure::TokenMismatch).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["code"], "CSRF_TOKEN_MISMATCH");
    }

    #[tokio::test]
    async fn test_unsupported_media_type_reports_both_types() {
        let response = AppError::UnsupportedMediaType {
            expected: "application/json",
            received: Some("text/plain".into()),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let body = body_json(response).await;
        assert_eq!(body["details"]["expected"], "application/json");
        assert_eq!(body["details"]["received"], "text/plain");
    }

    #[test]
    fn test_unauthorized_challenges_bearer() {
        let response = AppError::Unauthorized("missing token".into()).into_response();
        assert_eq!(response.headers().get(WWW_AUTHENTICATE).unwrap(), "Bearer");
    }

    #[test]
    fn test_sanitize_serde_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Payload {
            name: String,
        }

        let err = serde_json::from_str::<Payload>("{}").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Missing required field: name");

        let err = serde_json::from_str::<Payload>("{").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Malformed JSON in request body");
    }
}
