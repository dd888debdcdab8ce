//! Bearer-token authentication stage.
//!
//! # Security Features
//!
//! - **Constant-time comparison**: static tokens are compared with
//!   [`subtle::ConstantTimeEq`] and every configured entry is checked, so
//!   response time does not reveal which prefix or which entry matched.
//! - **Failed-auth penalty**: every rejected credential charges extra points
//!   to the caller's rate-limit key and consumes the FAILED_AUTH budget.
//!   Once that budget is spent, further bad credentials get 429 instead of
//!   401. Recording the penalty is best-effort: a store failure never turns
//!   into an error response.
//!
//! # Usage
//!
//! Tokens for the built-in verifier come from `AUTH_TOKENS`, a JSON array:
//!
//! ```bash
//! AUTH_TOKENS='[{"token":"s3cret","user_id":"42","email":"a@example.com","roles":["admin"],"permissions":["members:write"]}]'
//! ```
//!
//! Clients then send `Authorization: Bearer s3cret`. Real deployments plug
//! in their own [`TokenVerifier`] (JWT validation, session lookup).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::middleware::ip::TrustedProxyConfig;
use crate::pipeline::{AuthenticatedIdentity, Next, RequestContext, Stage};
use crate::rate_limit::{ProfileName, RateLimitKey, RateLimitOutcome, RateLimiter};

/// Points charged per failed credential check.
pub const DEFAULT_PENALTY_POINTS: u32 = 1;

/// Resolves a bearer token to an identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `None` when the token is not recognized.
    async fn verify(&self, token: &str) -> Option<AuthenticatedIdentity>;
}

/// One `AUTH_TOKENS` entry.
#[derive(Clone, Deserialize)]
pub struct StaticTokenEntry {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl fmt::Debug for StaticTokenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenEntry")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

/// Verifier backed by a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    entries: Vec<StaticTokenEntry>,
}

impl StaticTokenVerifier {
    pub fn new(entries: Vec<StaticTokenEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<AuthenticatedIdentity> {
        let mut matched = None;
        for entry in &self.entries {
            let equal: Choice = if entry.token.len() == token.len() {
                entry.token.as_bytes().ct_eq(token.as_bytes())
            } else {
                Choice::from(0)
            };
            if bool::from(equal) && matched.is_none() {
                matched = Some(entry);
            }
        }

        matched.map(|entry| AuthenticatedIdentity {
            user_id: entry.user_id.clone(),
            user_email: entry.email.clone(),
            roles: entry.roles.clone(),
            permissions: entry.permissions.clone(),
        })
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
fn bearer_token(cx: &RequestContext) -> Option<&str> {
    let value = cx.header(AUTHORIZATION)?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Authentication stage.
pub struct AuthenticationStage {
    verifier: Arc<dyn TokenVerifier>,
    limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<TrustedProxyConfig>,
    penalty_profile: ProfileName,
    penalty_points: u32,
}

impl AuthenticationStage {
    /// Failed checks are charged against `penalty_profile`.
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        limiter: Arc<RateLimiter>,
        trusted_proxies: Arc<TrustedProxyConfig>,
        penalty_profile: ProfileName,
    ) -> Self {
        Self {
            verifier,
            limiter,
            trusted_proxies,
            penalty_profile,
            penalty_points: DEFAULT_PENALTY_POINTS,
        }
    }

    pub fn with_penalty_points(mut self, points: u32) -> Self {
        self.penalty_points = points;
        self
    }
}

impl fmt::Debug for AuthenticationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationStage")
            .field("penalty_profile", &self.penalty_profile)
            .field("penalty_points", &self.penalty_points)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for AuthenticationStage {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response> {
        let Some(token) = bearer_token(cx) else {
            debug!(request_id = %cx.request_id(), "Missing bearer token");
            return Ok(AppError::Unauthorized("Missing bearer token".to_string()).into_response());
        };

        match self.verifier.verify(token).await {
            Some(identity) => {
                debug!(request_id = %cx.request_id(), user_id = %identity.user_id, "Authenticated");
                cx.middleware.identity = Some(identity);
                next.run(cx).await
            }
            None => {
                let key = RateLimitKey::from_context(cx, &self.trusted_proxies);
                warn!(request_id = %cx.request_id(), key = %key, "Invalid bearer token");
                let budget = self
                    .limiter
                    .penalize(&key, self.penalty_profile, self.penalty_points)
                    .await;
                if let Some(budget) = budget.filter(|d| d.outcome == RateLimitOutcome::Limited) {
                    warn!(
                        request_id = %cx.request_id(),
                        key = %key,
                        "Failed-auth budget exhausted"
                    );
                    return Ok(AppError::RateLimited {
                        retry_after_secs: budget.retry_after_secs.unwrap_or(1),
                    }
                    .into_response());
                }
                Ok(AppError::Unauthorized("Invalid or expired token".to_string()).into_response())
            }
        }
    }
}
