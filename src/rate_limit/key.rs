//! Rate-limit key derivation.
//!
//! Authenticated requests are keyed by user so one account cannot escape its
//! budget by rotating addresses behind a shared NAT. Everything else is keyed
//! by client address.

use std::fmt;

use crate::middleware::ip::{TrustedProxyConfig, client_ip};
use crate::pipeline::RequestContext;

/// `user:<id>` or `ip:<addr>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn for_user(user_id: &str) -> Self {
        Self(format!("user:{user_id}"))
    }

    pub fn for_ip(addr: &str) -> Self {
        Self(format!("ip:{addr}"))
    }

    /// Prefer the authenticated identity, else the resolved client address.
    pub fn from_context(cx: &RequestContext, trusted_proxies: &TrustedProxyConfig) -> Self {
        match cx.identity() {
            Some(identity) => Self::for_user(&identity.user_id),
            None => Self::for_ip(&client_ip(cx.headers(), cx.peer_addr(), trusted_proxies)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
