//! CSRF double-submit stage.
//!
//! Runs after authentication. Safe methods pass; an authenticated client
//! without a well-formed `csrf_token` cookie is issued a fresh token through
//! the context, and the composer writes the `Set-Cookie` header.
//! State-changing methods must carry matching cookie and header tokens.

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::clock::SharedClock;
use crate::csrf::{
    CSRF_COOKIE_NAME, CSRF_HEADER_NAME, CsrfFailure, CsrfToken, is_well_formed,
    requires_verification, verify_double_submit,
};
use crate::error::AppError;
use crate::metrics;
use crate::pipeline::{Next, RequestContext, Stage};

/// CSRF verification and issuance stage.
#[derive(Debug, Clone)]
pub struct CsrfStage {
    clock: SharedClock,
}

impl CsrfStage {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }
}

fn reject(failure: CsrfFailure) -> Response {
    metrics::record_csrf_failure(failure.code());
    AppError::Csrf(failure).into_response()
}

#[async_trait]
impl Stage for CsrfStage {
    fn name(&self) -> &'static str {
        "csrf"
    }

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response> {
        if !requires_verification(cx.method()) {
            let needs_token = !cx.cookie(CSRF_COOKIE_NAME).is_some_and(is_well_formed);
            let user_id = cx.identity().map(|identity| identity.user_id.clone());
            if needs_token && let Some(user_id) = user_id {
                let token = CsrfToken::generate(Some(&user_id), self.clock.now_utc());
                cx.middleware.csrf_token_to_set = Some(token);
            }
            return next.run(cx).await;
        }

        if cx.identity().is_none() {
            error!(
                request_id = %cx.request_id(),
                "CSRF stage reached without an authenticated identity; check stage order"
            );
            return Ok(reject(CsrfFailure::AuthenticationRequired));
        }

        match verify_double_submit(cx.cookie(CSRF_COOKIE_NAME), cx.header(CSRF_HEADER_NAME)) {
            Ok(()) => next.run(cx).await,
            Err(failure) => {
                warn!(
                    request_id = %cx.request_id(),
                    code = failure.code(),
                    "CSRF verification failed"
                );
                Ok(reject(failure))
            }
        }
    }
}
