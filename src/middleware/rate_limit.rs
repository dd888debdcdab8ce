//! Rate limiting stage.
//!
//! Derives the key (user if authenticated, else client address), asks the
//! [`RateLimiter`] for a decision and records it in the context.
//!
//! # Response Headers
//!
//! Every response passing through this stage, allowed or not, carries
//! `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
//! (epoch seconds).
//!
//! - Limited (429) and fail-closed (503) responses add `Retry-After`.
//! - A 503 means the shared counter store could not be consulted, not that
//!   the client misbehaved.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::middleware::ip::TrustedProxyConfig;
use crate::pipeline::{Next, RequestContext, Stage};
use crate::rate_limit::{
    FAIL_CLOSED_RETRY_AFTER_SECS, ProfileName, RateLimitKey, RateLimitOutcome, RateLimiter,
};

/// Rate limiting stage for one profile.
#[derive(Debug, Clone)]
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    profile: ProfileName,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitStage {
    pub fn new(
        limiter: Arc<RateLimiter>,
        profile: ProfileName,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Self {
        Self {
            limiter,
            profile,
            trusted_proxies,
        }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response> {
        let key = RateLimitKey::from_context(cx, &self.trusted_proxies);
        let decision = self.limiter.check(&key, self.profile).await;
        cx.middleware.rate_limit = Some(decision.clone());

        let mut response = match decision.outcome {
            RateLimitOutcome::Allowed => {
                debug!(key = %key, profile = %self.profile, remaining = decision.remaining, "Request admitted");
                next.run(cx).await?
            }
            RateLimitOutcome::Limited => {
                warn!(
                    request_id = %cx.request_id(),
                    key = %key,
                    profile = %self.profile,
                    "Rate limit exceeded"
                );
                AppError::RateLimited {
                    retry_after_secs: decision.retry_after_secs.unwrap_or(1),
                }
                .into_response()
            }
            RateLimitOutcome::Unavailable => AppError::ServiceUnavailable {
                retry_after_secs: decision
                    .retry_after_secs
                    .unwrap_or(FAIL_CLOSED_RETRY_AFTER_SECS),
            }
            .into_response(),
        };

        decision.apply_headers(response.headers_mut());
        Ok(response)
    }
}
