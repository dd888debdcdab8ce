//! Fuzz testing for request-derived token parsing.
//!
//! Feeds arbitrary bytes through the code that reads attacker-controlled
//! request data before any identity is known:
//!
//! - `Cookie` header parsing in `RequestContext::cookie`
//! - CSRF token format checking and double-submit comparison
//! - `X-Request-ID` validation and CIDR parsing
//!
//! None of these may panic, and a double-submit check may only pass when
//! both tokens are well-formed and identical.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_csrf -- -max_total_time=60
//! ```

#![no_main]

use admission_gate::csrf::{CSRF_COOKIE_NAME, is_well_formed, verify_double_submit};
use admission_gate::middleware::CidrRange;
use admission_gate::middleware::request_id::is_valid_request_id;
use admission_gate::pipeline::{MiddlewareContext, RequestContext};
use axum::body::Bytes;
use axum::http::header::COOKIE;
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First line is the Cookie header, the rest is the X-CSRF-Token value
    let split = data.iter().position(|b| *b == b'\n').unwrap_or(data.len());
    let (cookie_bytes, rest) = data.split_at(split);
    let header_token = std::str::from_utf8(rest.get(1..).unwrap_or_default()).ok();

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_bytes(cookie_bytes) {
        headers.insert(COOKIE, value);
    }
    let cx = RequestContext::new(
        Method::POST,
        Uri::from_static("/fuzz"),
        headers,
        Bytes::new(),
        None,
        MiddlewareContext::new("fuzz".to_string(), chrono::Utc::now()),
    );

    let cookie_token = cx.cookie(CSRF_COOKIE_NAME);
    if verify_double_submit(cookie_token, header_token).is_ok() {
        let (Some(cookie), Some(header)) = (cookie_token, header_token) else {
            panic!("double-submit passed with a missing token");
        };
        assert!(is_well_formed(cookie) && cookie == header.trim());
    }

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = is_valid_request_id(s);
        let _ = CidrRange::parse(s);
    }
});
