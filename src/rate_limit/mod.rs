//! Distributed rate limiting with fail-closed semantics.
//!
//! # Architecture
//!
//! ```text
//!   RateLimitStage ──► RateLimiter::check(key, profile)
//!                          │
//!          distributed ────┼──── in-process only
//!                          │
//!   CircuitBreaker ──► CounterStore         LocalRateLimiter (governor)
//!   (+ store timeout)  (Redis INCRBY+PEXPIRE)
//! ```
//!
//! The mode is chosen once at startup. The in-process path is never used as
//! an automatic fallback for `check`: when the shared store is unreachable or
//! its breaker is open, requests are denied with a service-unavailable
//! decision. Only the best-effort failed-auth penalty falls back to the
//! in-process counters.

pub mod decision;
pub mod key;
pub mod limiter;
pub mod local;
pub mod profile;
pub mod redis_store;
pub mod store;

pub use decision::{RateLimitDecision, RateLimitOutcome};
pub use key::RateLimitKey;
pub use limiter::{FAIL_CLOSED_RETRY_AFTER_SECS, RateLimiter, STORE_BREAKER_NAME};
pub use local::LocalRateLimiter;
pub use profile::{ProfileName, RateLimitProfile, RateLimitProfiles};
pub use redis_store::RedisCounterStore;
pub use store::{CounterSnapshot, CounterStore, MemoryCounterStore, StoreError};
