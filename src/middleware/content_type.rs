//! Content-Type validation for mutation requests.
//!
//! POST, PUT and PATCH must declare `application/json`. Parameters such as
//! `; charset=utf-8` are stripped before comparison and the media type is
//! compared case-insensitively. Other methods are not checked.

use async_trait::async_trait;
use axum::http::Method;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::AppError;
use crate::pipeline::{Next, RequestContext, Stage};

pub const EXPECTED_CONTENT_TYPE: &str = "application/json";

/// Content-Type validation stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentTypeStage;

impl ContentTypeStage {
    pub fn new() -> Self {
        Self
    }
}

fn is_mutation(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Media type without parameters, trimmed.
fn media_type(value: &str) -> &str {
    value.split(';').next().unwrap_or_default().trim()
}

#[async_trait]
impl Stage for ContentTypeStage {
    fn name(&self) -> &'static str {
        "content-type"
    }

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response> {
        if !is_mutation(cx.method()) {
            return next.run(cx).await;
        }

        let received = cx.header(CONTENT_TYPE);
        if received.is_some_and(|value| media_type(value).eq_ignore_ascii_case(EXPECTED_CONTENT_TYPE))
        {
            return next.run(cx).await;
        }

        debug!(
            request_id = %cx.request_id(),
            received = ?received,
            "Rejected request with unsupported content type"
        );
        Ok(AppError::UnsupportedMediaType {
            expected: EXPECTED_CONTENT_TYPE,
            received: received.map(str::to_owned),
        }
        .into_response())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{request, run_stage};
    use axum::http::StatusCode;

    #[test]
    fn test_media_type_strips_parameters() {
        assert_eq!(media_type("application/json; charset=utf-8"), "application/json");
        assert_eq!(media_type("  text/plain "), "text/plain");
        assert_eq!(media_type(""), "");
    }

    #[tokio::test]
    async fn test_json_with_charset_passes() {
        let cx = request(
            Method::POST,
            &[("content-type", "application/json; charset=utf-8")],
        );
        assert!(run_stage(ContentTypeStage::new(), cx).await.reached);
    }

    #[tokio::test]
    async fn test_missing_content_type_is_rejected() {
        let run = run_stage(ContentTypeStage::new(), request(Method::PUT, &[])).await;
        assert!(!run.reached);
        assert_eq!(run.response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_rejected() {
        let cx = request(Method::PATCH, &[("content-type", "application/jsonp")]);
        let run = run_stage(ContentTypeStage::new(), cx).await;
        assert_eq!(run.response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_non_mutation_methods_are_not_checked() {
        for method in [Method::GET, Method::DELETE, Method::HEAD] {
            let run = run_stage(ContentTypeStage::new(), request(method, &[])).await;
            assert!(run.reached);
        }
    }
}
