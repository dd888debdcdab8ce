//! HTTPS enforcement stage.
//!
//! Active only when `HTTPS_ONLY=true` and the environment is production-like
//! (staging or production); otherwise it is a pass-through. A request counts
//! as TLS when the request URI carries the `https` scheme or the first
//! `X-Forwarded-Proto` value from the terminating proxy is `https`.

use async_trait::async_trait;
use axum::http::header::{HOST, STRICT_TRANSPORT_SECURITY};
use axum::http::uri::Scheme;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::error::AppError;
use crate::pipeline::security_headers::HSTS_VALUE;
use crate::pipeline::{Next, RequestContext, Stage};

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// HTTPS enforcement stage.
#[derive(Debug, Clone, Copy)]
pub struct HttpsStage {
    enforce: bool,
}

impl HttpsStage {
    /// `enforce` should be `https_only && environment.is_production_like()`.
    pub fn new(enforce: bool) -> Self {
        Self { enforce }
    }
}

fn is_secure(cx: &RequestContext) -> bool {
    if cx.uri().scheme() == Some(&Scheme::HTTPS) {
        return true;
    }
    cx.header(FORWARDED_PROTO)
        .and_then(|value| value.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

fn upgrade_url(cx: &RequestContext) -> Option<String> {
    let host = cx.header(HOST).or_else(|| cx.uri().host())?;
    let path = cx
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Some(format!("https://{host}{path}"))
}

#[async_trait]
impl Stage for HttpsStage {
    fn name(&self) -> &'static str {
        "https"
    }

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response> {
        if !self.enforce {
            return next.run(cx).await;
        }

        if !is_secure(cx) {
            warn!(
                request_id = %cx.request_id(),
                path = cx.path(),
                "Rejected plain HTTP request"
            );
            return Ok(AppError::HttpsRequired {
                upgrade_url: upgrade_url(cx),
            }
            .into_response());
        }

        let mut response = next.run(cx).await?;
        response.headers_mut().insert(
            STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS_VALUE),
        );
        Ok(response)
    }
}
