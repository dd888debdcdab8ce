//! Shared counter store contract.
//!
//! The limiter only needs one primitive from its backing store: atomically
//! add points to a key, starting a fresh expiry window when the key is new,
//! and report the new count plus the time left in that window. Any error
//! (including a timeout imposed by the caller) means "unreachable" and is
//! counted as a failure by the circuit breaker.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::{SharedClock, duration_millis};

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("counter store returned an unexpected reply: {0}")]
    Backend(String),
}

/// Counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Points consumed in the current window, including this increment.
    pub count: u64,
    /// Time until the window resets.
    pub ttl_remaining: Duration,
}

/// Atomic increment-with-expiry store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `points` to `key`. A new key expires after `ttl`; an existing key
    /// keeps its original expiry.
    async fn increment(
        &self,
        key: &str,
        points: u32,
        ttl: Duration,
    ) -> Result<CounterSnapshot, StoreError>;

    /// Short backend name for logs and readiness output.
    fn backend(&self) -> &'static str;

    /// Drop expired windows. Returns how many were removed.
    ///
    /// Backends with native key expiry keep the default no-op.
    fn purge_expired(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: u64,
}

/// In-memory implementation of the store contract.
///
/// A single mutex makes every increment atomic. Like the governor-based
/// in-process limiter, counts are not shared between processes.
#[derive(Debug)]
pub struct MemoryCounterStore {
    clock: SharedClock,
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryCounterStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tracked keys (expired or not).
    pub fn len(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        points: u32,
        ttl: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now_millis();
        let ttl_ms = duration_millis(ttl);
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now.saturating_add(ttl_ms),
        });
        if window.expires_at <= now {
            *window = Window {
                count: 0,
                expires_at: now.saturating_add(ttl_ms),
            };
        }
        window.count = window.count.saturating_add(u64::from(points));

        Ok(CounterSnapshot {
            count: window.count,
            ttl_remaining: Duration::from_millis(window.expires_at.saturating_sub(now)),
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, window| window.expires_at > now);
        before - windows.len()
    }
}
