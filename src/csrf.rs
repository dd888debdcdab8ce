//! CSRF protection using the double-submit cookie pattern.
//!
//! A random token is handed to the client in a cookie it can read (not
//! `HttpOnly`), and every state-changing request must echo the same token in
//! the `X-CSRF-Token` header. A cross-site page can make the browser send the
//! cookie but cannot read it to forge the header.
//!
//! # Verification order
//!
//! Each failure has its own code so clients and dashboards can tell them
//! apart:
//!
//! 1. no cookie token → `CSRF_COOKIE_MISSING`
//! 2. no header token → `CSRF_HEADER_MISSING`
//! 3. either token is not exactly 64 hex characters → `CSRF_TOKEN_INVALID_FORMAT`
//! 4. tokens differ (constant-time comparison) → `CSRF_TOKEN_MISMATCH`

use axum::http::{Method, StatusCode};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Cookie carrying the token.
pub const CSRF_COOKIE_NAME: &str = "csrf_token";

/// Header the client echoes the token in.
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

/// Random bytes per token.
pub const TOKEN_BYTES: usize = 32;

/// Hex-encoded token length.
pub const TOKEN_HEX_LEN: usize = TOKEN_BYTES * 2;

/// Token lifetime, also used as the cookie `Max-Age`.
pub const TOKEN_LIFETIME_SECS: i64 = 30 * 60;

/// An issued CSRF token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsrfToken {
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl CsrfToken {
    /// Generate a token from 32 bytes of OS-seeded CSPRNG output.
    pub fn generate(user_id: Option<&str>, now: DateTime<Utc>) -> Self {
        let bytes: [u8; TOKEN_BYTES] = rand::random();
        Self {
            value: hex::encode(bytes),
            created_at: now,
            expires_at: now + TimeDelta::seconds(TOKEN_LIFETIME_SECS),
            user_id: user_id.map(str::to_owned),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// `Set-Cookie` value. Readable by scripts so the client can echo it.
    pub fn set_cookie_value(&self) -> String {
        format!(
            "{CSRF_COOKIE_NAME}={}; Path=/; Max-Age={TOKEN_LIFETIME_SECS}; Secure; SameSite=Strict",
            self.value
        )
    }
}

/// Why a request failed CSRF verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CsrfFailure {
    #[error("CSRF cookie is missing")]
    MissingCookie,

    #[error("CSRF header is missing")]
    MissingHeader,

    #[error("CSRF token has an invalid format")]
    MalformedToken,

    #[error("CSRF tokens do not match")]
    TokenMismatch,

    #[error("Authentication is required before CSRF verification")]
    AuthenticationRequired,
}

impl CsrfFailure {
    /// Machine-readable error code.
    pub fn code(self) -> &'static str {
        match self {
            CsrfFailure::MissingCookie => "CSRF_COOKIE_MISSING",
            CsrfFailure::MissingHeader => "CSRF_HEADER_MISSING",
            CsrfFailure::MalformedToken => "CSRF_TOKEN_INVALID_FORMAT",
            CsrfFailure::TokenMismatch => "CSRF_TOKEN_MISMATCH",
            CsrfFailure::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            CsrfFailure::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            _ => StatusCode::FORBIDDEN,
        }
    }
}

/// Whether requests with this method must carry a valid token.
pub fn requires_verification(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Exactly 64 hex characters.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_HEX_LEN && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Constant-time equality for equal-length tokens.
///
/// Only the length check can short-circuit; the byte comparison takes the
/// same time wherever the first difference is.
pub fn tokens_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Check a cookie/header token pair. Empty values count as missing.
///
/// # Errors
///
/// Returns the first failing check in the documented order.
pub fn verify_double_submit(
    cookie_token: Option<&str>,
    header_token: Option<&str>,
) -> Result<(), CsrfFailure> {
    let cookie = cookie_token
        .filter(|t| !t.is_empty())
        .ok_or(CsrfFailure::MissingCookie)?;
    let header = header_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(CsrfFailure::MissingHeader)?;

    if !is_well_formed(cookie) || !is_well_formed(header) {
        return Err(CsrfFailure::MalformedToken);
    }

    if !tokens_match(cookie, header) {
        return Err(CsrfFailure::TokenMismatch);
    }

    Ok(())
}
