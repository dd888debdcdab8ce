//! Admission stages.
//!
//! Each stage implements [`crate::pipeline::Stage`]. The reference order is:
//!
//! ```text
//! CORS → HTTPS → Rate Limit → Content-Type → Authenticate → Authorize → CSRF → handler
//!  │       │         │              │              │             │         │
//! 204    403     429 / 503         415            401           403     403 / 401
//! ```
//!
//! Cheap public checks run first so preflights never pay for rate limiting
//! or authentication. Rate limiting precedes authentication to bound the
//! cost of credential probing. CSRF runs last because it needs an identity.
//!
//! # Security Considerations
//!
//! - Bearer tokens and CSRF tokens are compared in constant time
//! - Rate limiting fails closed when the shared store is unavailable
//! - Trusted proxy configuration mitigates address spoofing
//! - Request IDs enable audit trails and debugging

pub mod auth;
pub mod authorize;
pub mod content_type;
pub mod cors;
pub mod csrf;
pub mod https;
pub mod ip;
pub mod rate_limit;
pub mod request_id;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{AuthenticationStage, StaticTokenEntry, StaticTokenVerifier, TokenVerifier};
pub use authorize::AuthorizationStage;
pub use content_type::ContentTypeStage;
pub use cors::{AllowedOrigins, CorsStage};
pub use csrf::CsrfStage;
pub use https::HttpsStage;
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use rate_limit::RateLimitStage;
pub use request_id::REQUEST_ID_HEADER;
