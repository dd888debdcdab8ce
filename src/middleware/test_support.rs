//! Helpers for driving a single stage in unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::pipeline::{
    AuthenticatedIdentity, BusinessHandler, MiddlewareContext, Next, RequestContext, Stage,
};

/// Outcome of [`run_stage`].
pub(crate) struct StageRun {
    pub response: Response,
    /// Whether the stage called `next`.
    pub reached: bool,
    pub cx: RequestContext,
}

/// Stands in for the rest of the chain: records the call and returns 200.
struct Terminal {
    reached: Arc<AtomicBool>,
}

#[async_trait]
impl Stage for Terminal {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn handle(&self, _cx: &mut RequestContext, _next: Next<'_>) -> anyhow::Result<Response> {
        self.reached.store(true, Ordering::SeqCst);
        Ok(StatusCode::OK.into_response())
    }
}

struct Unreachable;

#[async_trait]
impl BusinessHandler for Unreachable {
    async fn handle(
        &self,
        _identity: AuthenticatedIdentity,
        _cx: &mut RequestContext,
    ) -> anyhow::Result<Response> {
        anyhow::bail!("terminal stage never calls next")
    }
}

pub(crate) fn request(method: Method, headers: &[(&'static str, &'static str)]) -> RequestContext {
    request_to(method, "/members", headers)
}

pub(crate) fn request_to(
    method: Method,
    uri: &'static str,
    headers: &[(&'static str, &'static str)],
) -> RequestContext {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    RequestContext::new(
        method,
        Uri::from_static(uri),
        map,
        Bytes::new(),
        None,
        MiddlewareContext::new("test-request".into(), Utc::now()),
    )
}

pub(crate) fn identity(user_id: &str) -> AuthenticatedIdentity {
    AuthenticatedIdentity {
        user_id: user_id.into(),
        user_email: format!("{user_id}@example.com"),
        roles: vec!["member".into()],
        permissions: vec!["members:read".into()],
    }
}

/// Run `stage` followed by a terminal stage.
pub(crate) async fn run_stage(stage: impl Stage + 'static, mut cx: RequestContext) -> StageRun {
    let reached = Arc::new(AtomicBool::new(false));
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(stage),
        Arc::new(Terminal {
            reached: reached.clone(),
        }),
    ];

    let response = Next::new(&stages, &Unreachable)
        .run(&mut cx)
        .await
        .unwrap_or_else(|e| panic!("stage failed: {e:#}"));

    StageRun {
        response,
        reached: reached.load(Ordering::SeqCst),
        cx,
    }
}
