//! Rate limiter decisions and their HTTP rendering.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::profile::ProfileName;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitOutcome {
    /// Within budget.
    Allowed,
    /// Budget exhausted (429).
    Limited,
    /// The shared store could not be consulted; denied fail-closed (503).
    Unavailable,
}

impl RateLimitOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitOutcome::Allowed => "allowed",
            RateLimitOutcome::Limited => "limited",
            RateLimitOutcome::Unavailable => "unavailable",
        }
    }
}

/// Immutable per-request, per-profile decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub profile: ProfileName,
    /// Configured points for the profile.
    pub limit: u32,
    pub outcome: RateLimitOutcome,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    pub fn allowed(&self) -> bool {
        self.outcome == RateLimitOutcome::Allowed
    }

    pub fn is_unavailable(&self) -> bool {
        self.outcome == RateLimitOutcome::Unavailable
    }

    /// Write `X-RateLimit-*` headers describing this decision.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let reset = self.reset_at.timestamp().max(0);
        for (name, value) in [
            (RATE_LIMIT_LIMIT_HEADER, self.limit.to_string()),
            (RATE_LIMIT_REMAINING_HEADER, self.remaining.to_string()),
            (RATE_LIMIT_RESET_HEADER, reset.to_string()),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }
}
