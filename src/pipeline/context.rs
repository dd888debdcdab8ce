//! Per-request state threaded through the stage chain.
//!
//! [`RequestContext`] carries the immutable request facts (method, URI,
//! headers, buffered body, peer address) plus a [`MiddlewareContext`]
//! scratch area that stages write into. One context exists per request and
//! it is dropped when the chain returns; nothing in it is shared.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Bytes;
use axum::http::header::{AsHeaderName, COOKIE};
use axum::http::{HeaderMap, Method, Uri};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::csrf::CsrfToken;
use crate::rate_limit::RateLimitDecision;

/// Identity established by the authentication stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedIdentity {
    pub user_id: String,
    pub user_email: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl AuthenticatedIdentity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Mutable per-request scratch state.
#[derive(Debug)]
pub struct MiddlewareContext {
    pub request_id: String,
    /// Monotonic start, used for elapsed-time logging.
    pub started_at: Instant,
    /// Wall-clock start, from the injected clock.
    pub received_at: DateTime<Utc>,
    /// Free-form values stages leave for later stages or post-processing.
    pub metadata: HashMap<&'static str, String>,
    pub identity: Option<AuthenticatedIdentity>,
    pub rate_limit: Option<RateLimitDecision>,
    /// Token to hand out via `Set-Cookie` during post-processing.
    pub csrf_token_to_set: Option<CsrfToken>,
}

impl MiddlewareContext {
    pub fn new(request_id: String, received_at: DateTime<Utc>) -> Self {
        Self {
            request_id,
            started_at: Instant::now(),
            received_at,
            metadata: HashMap::new(),
            identity: None,
            rate_limit: None,
            csrf_token_to_set: None,
        }
    }

    /// Milliseconds since the request entered the pipeline.
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}

/// Request facts plus scratch state.
#[derive(Debug)]
pub struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    peer_addr: Option<SocketAddr>,
    pub middleware: MiddlewareContext,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        peer_addr: Option<SocketAddr>,
        middleware: MiddlewareContext,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            peer_addr,
            middleware,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn request_id(&self) -> &str {
        &self.middleware.request_id
    }

    pub fn identity(&self) -> Option<&AuthenticatedIdentity> {
        self.middleware.identity.as_ref()
    }

    /// Header value as text. Absent and non-UTF-8 values are both `None`.
    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Value of cookie `name` from any `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .find_map(|pair| {
                let (key, value) = pair.trim().split_once('=')?;
                (key.trim() == name).then(|| value.trim())
            })
    }
}
