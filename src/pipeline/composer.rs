//! Ordered, short-circuiting stage chain.
//!
//! ```text
//!   handle(Request) ─► buffer body ─► RequestContext
//!                                         │
//!        ┌────────────────────────────────┘
//!        ▼
//!   stage 0 ──next──► stage 1 ──next──► … ──next──► BusinessHandler
//!      │                 │
//!      └── returns a response without calling next: short-circuit
//!
//!   fault boundary (Err or panic) ─► 500 with request id only
//!   post-process: Set-Cookie (CSRF) ─► X-Request-ID ─► security headers
//! ```
//!
//! The business handler runs only if every stage called `next`, and only
//! with an authenticated identity. Reaching the end of the chain with no
//! identity is a wiring fault and surfaces as a 500, never as an anonymous
//! handler call.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderValue, Method};
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use thiserror::Error;
use tracing::{debug, error};

use super::context::{AuthenticatedIdentity, MiddlewareContext, RequestContext};
use super::security_headers;
use crate::clock::{SharedClock, SystemClock};
use crate::error::AppError;
use crate::metrics;
use crate::middleware::request_id::{self, REQUEST_ID_HEADER};

/// Default limit for buffered request bodies (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Wiring faults detected while running the chain.
#[derive(Debug, Error)]
pub enum PipelineFault {
    #[error("stage chain completed without an authenticated identity")]
    MissingIdentity,
}

/// One guard in the chain.
///
/// A stage either returns its own response (short-circuit) or calls
/// [`Next::run`] and may decorate the response it gets back.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response>;
}

/// Terminal handler that receives admitted requests.
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    async fn handle(
        &self,
        identity: AuthenticatedIdentity,
        cx: &mut RequestContext,
    ) -> anyhow::Result<Response>;
}

/// Continuation over the remaining stages.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    handler: &'a dyn BusinessHandler,
}

impl<'a> Next<'a> {
    /// Cursor at the start of `stages`.
    pub fn new(stages: &'a [Arc<dyn Stage>], handler: &'a dyn BusinessHandler) -> Self {
        Self { stages, handler }
    }

    /// Run the next stage, or the business handler when none remain.
    pub async fn run(self, cx: &mut RequestContext) -> anyhow::Result<Response> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    handler: self.handler,
                };
                stage.handle(cx, next).await
            }
            None => {
                let identity = cx
                    .middleware
                    .identity
                    .clone()
                    .ok_or(PipelineFault::MissingIdentity)?;
                self.handler.handle(identity, cx).await
            }
        }
    }
}

/// Composed admission pipeline.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    handler: Arc<dyn BusinessHandler>,
    clock: SharedClock,
    max_body_size: usize,
}

impl Pipeline {
    pub fn builder(handler: Arc<dyn BusinessHandler>) -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            handler,
            clock: Arc::new(SystemClock),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Adapt an axum request and run it through the chain.
    ///
    /// The body is buffered up to the configured limit; larger bodies get a
    /// 413 that is still post-processed.
    pub async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let peer_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let request_id = request_id::extract_or_generate(&parts.headers);
        let middleware = MiddlewareContext::new(request_id, self.clock.now_utc());

        let body = match Limited::new(body, self.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let rejection = if e.downcast_ref::<LengthLimitError>().is_some() {
                    AppError::PayloadTooLarge {
                        limit: self.max_body_size,
                    }
                } else {
                    AppError::Validation("Failed to read request body".to_string())
                };
                debug!(request_id = %middleware.request_id, error = %e, "Rejected request body");
                return self.finish(&parts.method, &middleware, rejection.into_response());
            }
        };

        let cx = RequestContext::new(
            parts.method,
            parts.uri,
            parts.headers,
            body,
            peer_addr,
            middleware,
        );
        self.execute(cx).await
    }

    /// Run the chain for a prepared context.
    ///
    /// Never fails: errors and panics from stages or the handler become a
    /// generic 500 carrying only the request id.
    pub async fn execute(&self, mut cx: RequestContext) -> Response {
        let next = Next::new(&self.stages, self.handler.as_ref());
        let outcome = AssertUnwindSafe(next.run(&mut cx)).catch_unwind().await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                error!(
                    request_id = %cx.middleware.request_id,
                    elapsed_ms = cx.middleware.elapsed_ms() as u64,
                    error = format!("{err:#}"),
                    "Unhandled error in request pipeline"
                );
                self.fault_response(&cx)
            }
            Err(panic) => {
                error!(
                    request_id = %cx.middleware.request_id,
                    elapsed_ms = cx.middleware.elapsed_ms() as u64,
                    panic = panic_message(panic.as_ref()),
                    "Panic in request pipeline"
                );
                self.fault_response(&cx)
            }
        };

        self.finish(cx.method(), &cx.middleware, response)
    }

    fn fault_response(&self, cx: &RequestContext) -> Response {
        metrics::record_pipeline_fault();
        AppError::Internal {
            request_id: cx.middleware.request_id.clone(),
        }
        .into_response()
    }

    fn finish(
        &self,
        method: &Method,
        middleware: &MiddlewareContext,
        mut response: Response,
    ) -> Response {
        post_process(middleware, &mut response);

        let status = response.status().as_u16();
        let elapsed = middleware.started_at.elapsed();
        metrics::record_request(status);
        metrics::record_request_duration(method.as_str(), status, elapsed.as_secs_f64());
        debug!(
            request_id = %middleware.request_id,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
        response
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

/// Uniform response decoration, in fixed order.
fn post_process(middleware: &MiddlewareContext, response: &mut Response) {
    let headers = response.headers_mut();

    if let Some(token) = &middleware.csrf_token_to_set
        && let Ok(cookie) = HeaderValue::from_str(&token.set_cookie_value())
    {
        headers.append(SET_COOKIE, cookie);
    }

    headers.insert(
        REQUEST_ID_HEADER,
        request_id::header_value(&middleware.request_id),
    );

    security_headers::apply(headers);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    handler: Arc<dyn BusinessHandler>,
    clock: SharedClock,
    max_body_size: usize,
}

impl PipelineBuilder {
    /// Append a stage. Stages run in the order they are added.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            handler: self.handler,
            clock: self.clock,
            max_body_size: self.max_body_size,
        }
    }
}
