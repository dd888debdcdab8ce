//! Request ID assignment for correlation.
//!
//! The pipeline assigns the id before any stage runs and echoes it in the
//! `X-Request-ID` response header during post-processing, so short-circuit
//! and fault responses carry it too.
//!
//! # Client Usage
//!
//! Clients can provide their own request ID:
//!
//! ```bash
//! curl -H "X-Request-ID: my-correlation-id" http://localhost:3000/members
//! ```
//!
//! A client id is reused only if it is 1 to 128 visible ASCII characters;
//! anything else is replaced by a fresh UUID v4 so it can never break header
//! serialization or log lines.

use axum::http::HeaderMap;
use axum::http::header::HeaderValue;
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id that is reused.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Fallback header value when the id cannot be encoded.
static UNKNOWN_REQUEST_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Whether a client-supplied id can be reused as is.
pub fn is_valid_request_id(id: &str) -> bool {
    (1..=MAX_REQUEST_ID_LEN).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_graphic())
}

/// Reuse a valid incoming `X-Request-ID` or generate a UUID v4.
pub fn extract_or_generate(headers: &HeaderMap) -> String {
    if let Some(value) = headers.get(REQUEST_ID_HEADER)
        && let Ok(value) = value.to_str()
        && is_valid_request_id(value)
    {
        return value.to_string();
    }

    Uuid::new_v4().to_string()
}

/// Header value for `id`.
pub fn header_value(id: &str) -> HeaderValue {
    HeaderValue::from_str(id).unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(id: &'static str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(REQUEST_ID_HEADER, HeaderValue::from_static(id));
        map
    }

    #[test]
    fn test_extract_existing_request_id() {
        assert_eq!(extract_or_generate(&headers("existing-id-123")), "existing-id-123");
    }

    #[test]
    fn test_generate_new_request_id() {
        let id = extract_or_generate(&HeaderMap::new());
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_invalid_ids_are_replaced() {
        for bad in ["", "has space", "tab\tinside"] {
            let id = extract_or_generate(&headers(bad));
            assert!(Uuid::parse_str(&id).is_ok(), "{bad:?} should be replaced");
        }

        let long = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        let mut map = HeaderMap::new();
        map.insert(REQUEST_ID_HEADER, HeaderValue::from_str(&long).unwrap());
        assert_ne!(extract_or_generate(&map), long);
    }

    #[test]
    fn test_max_length_id_is_kept() {
        let id = "b".repeat(MAX_REQUEST_ID_LEN);
        assert!(is_valid_request_id(&id));
    }
}
