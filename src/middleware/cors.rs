//! CORS origin validation stage.
//!
//! `OPTIONS` requests are answered here with a 204 and preflight headers,
//! before any rate-limit or authentication cost is paid. For other methods
//! the origin decision is stored in the context metadata and the eventual
//! response (including short-circuit responses from later stages) gets the
//! same headers.
//!
//! An origin is echoed in `Access-Control-Allow-Origin` only when it is in
//! the allow-list or the list is the wildcard. A disallowed origin still gets
//! a 204 preflight, just without the allow header, so the browser blocks it.
//!
//! `Access-Control-Allow-Credentials` is sent only for origins named in an
//! explicit list. Under the wildcard, browsers will not expose credentialed
//! responses to the calling page.

use async_trait::async_trait;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ORIGIN,
    VARY,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::pipeline::{Next, RequestContext, Stage};

/// Metadata key holding the echoed origin.
pub const CORS_ORIGIN_METADATA: &str = "cors_origin";

const ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, X-CSRF-Token, X-Request-ID";
const EXPOSE_HEADERS: &str =
    "X-Request-ID, X-RateLimit-Limit, X-RateLimit-Remaining, X-RateLimit-Reset";
const PREFLIGHT_MAX_AGE_SECS: u32 = 600;

/// Origins allowed to make cross-origin requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    /// `*`: every origin is echoed, without credentials.
    Any,
    /// Exact origins (scheme, host and port).
    List(Vec<String>),
}

impl AllowedOrigins {
    /// Parse `*` or a comma-separated list. Blank entries are dropped.
    pub fn parse(value: &str) -> Self {
        let entries: Vec<String> = value
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if entries.iter().any(|s| s == "*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(entries)
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(list) => list.iter().any(|allowed| allowed == origin),
        }
    }
}

/// CORS stage.
#[derive(Debug, Clone)]
pub struct CorsStage {
    origins: AllowedOrigins,
}

impl CorsStage {
    pub fn new(origins: AllowedOrigins) -> Self {
        Self { origins }
    }

    fn allowed_origin(&self, cx: &RequestContext) -> Option<OriginGrant> {
        let origin = cx.header(ORIGIN)?;
        if !self.origins.allows(origin) {
            debug!(origin, "Origin not in CORS allow-list");
            return None;
        }
        Some(OriginGrant {
            value: HeaderValue::from_str(origin).ok()?,
            credentials: matches!(self.origins, AllowedOrigins::List(_)),
        })
    }
}

/// An origin accepted for this request.
struct OriginGrant {
    value: HeaderValue,
    /// Explicitly listed, so credentialed requests may be read.
    credentials: bool,
}

fn apply_origin(headers: &mut HeaderMap, origin: Option<OriginGrant>) {
    headers.append(VARY, HeaderValue::from_static("Origin"));
    if let Some(origin) = origin {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.value);
        if origin.credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }
}

#[async_trait]
impl Stage for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response> {
        let origin = self.allowed_origin(cx);

        if cx.method() == Method::OPTIONS {
            let mut response = StatusCode::NO_CONTENT.into_response();
            let headers = response.headers_mut();
            apply_origin(headers, origin);
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOW_METHODS),
            );
            headers.insert(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOW_HEADERS),
            );
            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(PREFLIGHT_MAX_AGE_SECS));
            return Ok(response);
        }

        if let Some(origin) = origin.as_ref().and_then(|o| o.value.to_str().ok()) {
            cx.middleware
                .metadata
                .insert(CORS_ORIGIN_METADATA, origin.to_string());
        }

        let mut response = next.run(cx).await?;
        let headers = response.headers_mut();
        apply_origin(headers, origin);
        headers.insert(
            ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSE_HEADERS),
        );
        Ok(response)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{request, run_stage};

    fn stage(origins: &str) -> CorsStage {
        CorsStage::new(AllowedOrigins::parse(origins))
    }

    #[test]
    fn test_parse_allowed_origins() {
        assert_eq!(AllowedOrigins::parse("*"), AllowedOrigins::Any);
        assert_eq!(
            AllowedOrigins::parse("https://a.example, https://b.example/ ,"),
            AllowedOrigins::List(vec![
                "https://a.example".into(),
                "https://b.example".into()
            ])
        );
        assert!(!AllowedOrigins::parse("").allows("https://a.example"));
    }

    #[tokio::test]
    async fn test_preflight_from_allowed_origin() {
        let cx = request(Method::OPTIONS, &[("origin", "https://app.example")]);
        let run = run_stage(stage("https://app.example"), cx).await;
        let (response, reached) = (run.response, run.reached);

        assert!(!reached);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example"
        );
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
        assert_eq!(headers.get(ACCESS_CONTROL_MAX_AGE).unwrap(), "600");
        assert_eq!(headers.get(VARY).unwrap(), "Origin");
    }

    #[tokio::test]
    async fn test_preflight_from_disallowed_origin_has_no_allow_origin() {
        let cx = request(Method::OPTIONS, &[("origin", "https://evil.example")]);
        let run = run_stage(stage("https://app.example"), cx).await;
        let (response, reached) = (run.response, run.reached);

        assert!(!reached);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[tokio::test]
    async fn test_wildcard_echoes_origin() {
        let cx = request(Method::GET, &[("origin", "https://any.example")]);
        let run = run_stage(stage("*"), cx).await;
        let (response, reached) = (run.response, run.reached);

        assert!(reached);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://any.example"
        );
        assert!(response.headers().contains_key(ACCESS_CONTROL_EXPOSE_HEADERS));
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[tokio::test]
    async fn test_wildcard_never_allows_credentials() {
        for method in [Method::OPTIONS, Method::GET] {
            let cx = request(method, &[("origin", "https://evil.example")]);
            let run = run_stage(stage("*"), cx).await;
            assert!(run.response.headers().get(ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
        }
    }

    #[tokio::test]
    async fn test_listed_origin_allows_credentials_on_responses() {
        let cx = request(Method::GET, &[("origin", "https://app.example")]);
        let run = run_stage(stage("https://app.example"), cx).await;

        assert!(run.reached);
        let headers = run.response.headers();
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "https://app.example");
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
    }

    #[tokio::test]
    async fn test_request_without_origin() {
        let cx = request(Method::GET, &[]);
        let run = run_stage(stage("*"), cx).await;
        let (response, reached) = (run.response, run.reached);

        assert!(reached);
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert_eq!(response.headers().get(VARY).unwrap(), "Origin");
    }
}
