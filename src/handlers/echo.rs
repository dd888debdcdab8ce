//! Demo business handler.
//!
//! Stands in for the CRUD controllers behind the pipeline: it echoes what
//! the admission stages established about the request.

use async_trait::async_trait;
use axum::Json;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::AppError;
use crate::models::AdmittedResponse;
use crate::pipeline::{AuthenticatedIdentity, BusinessHandler, RequestContext};

/// Echoes the admitted identity and request facts as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl BusinessHandler for EchoHandler {
    async fn handle(
        &self,
        identity: AuthenticatedIdentity,
        cx: &mut RequestContext,
    ) -> anyhow::Result<Response> {
        debug!(
            request_id = %cx.request_id(),
            user_id = %identity.user_id,
            path = cx.path(),
            "Request admitted to business handler"
        );

        // Content-Type was already enforced; malformed JSON is a client error
        let payload = if cx.body().is_empty() {
            None
        } else {
            match serde_json::from_slice::<serde_json::Value>(cx.body()) {
                Ok(value) => Some(value),
                Err(e) => return Ok(AppError::from(e).into_response()),
            }
        };

        let body = AdmittedResponse {
            request_id: cx.request_id().to_string(),
            method: cx.method().to_string(),
            path: cx.path().to_string(),
            user_id: identity.user_id,
            roles: identity.roles,
            rate_limit_remaining: cx.middleware.rate_limit.as_ref().map(|d| d.remaining),
            body_bytes: cx.body().len(),
            payload,
        };
        Ok(Json(body).into_response())
    }
}
