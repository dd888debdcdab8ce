//! Circuit breaker guarding calls to the shared counter store.
//!
//! The breaker stops hammering a failing dependency and lets the rate limiter
//! fail closed immediately instead of waiting on timeouts.
//!
//! # States
//!
//! ```text
//!            failures ≥ threshold
//!   ┌────────┐ ───────────────────► ┌────────┐
//!   │ Closed │                      │  Open  │ ◄──────────────┐
//!   └────────┘ ◄──┐                 └───┬────┘                │
//!                 │ first trial         │ next call after     │ failures ≥ threshold
//!                 │ success             │ open_duration       │
//!                 │                     ▼                     │
//!                 │               ┌──────────┐                │
//!                 └────────────── │ HalfOpen │ ───────────────┘
//!                                 └──────────┘
//!                         at most `half_open_max_requests` in flight
//! ```
//!
//! There is no background timer: the Open → HalfOpen transition happens
//! lazily when a call arrives after the cool-down. The hard trigger for
//! opening is the consecutive-failure counter, which any success resets and
//! which restarts from zero when a half-open probe period begins. A rolling
//! list of failure timestamps inside `monitor_window` is kept purely for
//! observability.
//!
//! # Usage
//!
//! ```rust,ignore
//! let breaker = registry.get("redis");
//! match breaker.execute(|| store.increment(&key, 1, ttl)).await {
//!     Ok(snapshot) => { /* use the count */ }
//!     Err(BreakerError::Open { .. }) => { /* fail closed without touching the store */ }
//!     Err(BreakerError::Operation(e)) => { /* store failed, also fail closed */ }
//! }
//! ```

pub mod registry;
mod scopeguard;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, duration_millis};
use crate::metrics;

pub use registry::CircuitBreakerRegistry;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through and failures are counted.
    Closed,
    /// Failing fast - calls are rejected without touching the dependency.
    Open,
    /// Testing recovery - a bounded number of trial calls pass through.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge.
    pub fn gauge_value(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub error_threshold: u32,
    /// How long the circuit stays open before a call may probe it.
    pub open_duration: Duration,
    /// Maximum concurrent trial calls while half-open.
    pub half_open_max_requests: u32,
    /// Window over which failure timestamps are retained for observability.
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 3,
            monitor_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    pub fn new(
        error_threshold: u32,
        open_duration: Duration,
        half_open_max_requests: u32,
        monitor_window: Duration,
    ) -> Self {
        Self {
            error_threshold,
            open_duration,
            half_open_max_requests,
            monitor_window,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },
    /// The wrapped operation ran and failed.
    #[error("guarded operation failed: {0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected without running.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Circuit closed.
    Pass,
    /// Half-open trial holding one slot of the given probe period.
    Trial { epoch: u64 },
}

/// Mutable state, guarded by a single mutex per breaker.
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<u64>,
    recent_failures: VecDeque<u64>,
    half_open_in_flight: u32,
    /// Incremented every time a probe period starts, so stale trials from an
    /// earlier period never free slots of the current one.
    half_open_epoch: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            recent_failures: VecDeque::new(),
            half_open_in_flight: 0,
            half_open_epoch: 0,
        }
    }

    /// Whether `admission` is a trial of the probe period in progress.
    fn is_current_trial(&self, admission: Admission) -> bool {
        matches!(admission, Admission::Trial { epoch }
            if self.state == CircuitState::HalfOpen && epoch == self.half_open_epoch)
    }

    fn release(&mut self, admission: Admission) {
        if self.is_current_trial(admission) {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    fn prune_failures(&mut self, now: u64, window_ms: u64) {
        while let Some(&oldest) = self.recent_failures.front() {
            if now.saturating_sub(oldest) > window_ms {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Thread-safe circuit breaker.
///
/// One instance exists per logical dependency and is shared by every
/// concurrent request through [`CircuitBreakerRegistry`].
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    /// Total number of times the circuit has been opened.
    times_opened: AtomicU32,
    /// Total number of calls rejected without running.
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner::new()),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] immediately, without calling
    /// `operation`, when the circuit is open or the half-open trial cap is
    /// reached. Otherwise the outcome is recorded and failures are returned
    /// as [`BreakerError::Operation`] so the caller can apply its own policy.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit() else {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        };

        // Returns the trial slot if this future is dropped before settling.
        let slot = scopeguard::guard(admission, |admission| {
            self.lock().release(admission);
        });

        let result = operation().await;
        let admission = slot.defuse().unwrap_or(Admission::Pass);

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(admission);
                Err(BreakerError::Operation(e))
            }
        }
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. Open → HalfOpen is only applied when a call arrives.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Failures recorded within the monitor window.
    pub fn recent_failures(&self) -> usize {
        let now = self.clock.now_millis();
        let window_ms = duration_millis(self.config.monitor_window);
        self.lock()
            .recent_failures
            .iter()
            .filter(|&&at| now.saturating_sub(at) <= window_ms)
            .count()
    }

    /// Trial calls currently in flight while half-open.
    pub fn half_open_in_flight(&self) -> u32 {
        self.lock().half_open_in_flight
    }

    /// Number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Number of calls rejected without running.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    /// Force the circuit to close (manual recovery).
    pub fn force_close(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner {
            half_open_epoch: inner.half_open_epoch,
            ..BreakerInner::new()
        };
        metrics::set_circuit_breaker_state(&self.name, CircuitState::Closed.gauge_value());
        info!(breaker = %self.name, "Circuit breaker forcibly closed");
    }

    /// Force the circuit to open (manual intervention).
    pub fn force_open(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        self.trip(&mut inner);
        warn!(breaker = %self.name, "Circuit breaker forcibly opened");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Option<Admission> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let open_ms = duration_millis(self.config.open_duration);
            let cooled_down = inner
                .last_failure_at
                .is_none_or(|at| now.saturating_sub(at) >= open_ms);
            if cooled_down {
                inner.state = CircuitState::HalfOpen;
                inner.failure_count = 0;
                inner.half_open_in_flight = 0;
                inner.half_open_epoch += 1;
                metrics::set_circuit_breaker_state(&self.name, CircuitState::HalfOpen.gauge_value());
                info!(breaker = %self.name, "Circuit breaker transitioning from Open to HalfOpen");
            }
        }

        match inner.state {
            CircuitState::Closed => Some(Admission::Pass),
            CircuitState::HalfOpen
                if inner.half_open_in_flight < self.config.half_open_max_requests =>
            {
                inner.half_open_in_flight += 1;
                debug!(
                    breaker = %self.name,
                    in_flight = inner.half_open_in_flight,
                    "Admitting half-open trial call"
                );
                Some(Admission::Trial {
                    epoch: inner.half_open_epoch,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                drop(inner);
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_breaker_rejection(&self.name);
                None
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        let current_trial = inner.is_current_trial(admission);
        inner.release(admission);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen if !current_trial => {
                debug!(breaker = %self.name, "Ignoring success of a call admitted before HalfOpen");
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.last_failure_at = None;
                inner.recent_failures.clear();
                inner.half_open_in_flight = 0;
                metrics::set_circuit_breaker_state(&self.name, CircuitState::Closed.gauge_value());
                info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Ignoring late success while Open");
            }
        }
    }

    fn on_failure(&self, admission: Admission) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && !inner.is_current_trial(admission) {
            debug!(breaker = %self.name, "Ignoring failure of a call admitted before HalfOpen");
            return;
        }
        inner.release(admission);

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);
        inner.recent_failures.push_back(now);
        inner.prune_failures(now, duration_millis(self.config.monitor_window));

        debug!(
            breaker = %self.name,
            state = %inner.state,
            consecutive_failures = inner.failure_count,
            threshold = self.config.error_threshold,
            "Circuit breaker recorded failure"
        );

        if inner.state != CircuitState::Open && inner.failure_count >= self.config.error_threshold
        {
            self.trip(&mut inner);
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                recent_failures = inner.recent_failures.len(),
                open_duration = ?self.config.open_duration,
                "Circuit breaker opened due to consecutive failures"
            );
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.half_open_in_flight = 0;
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_breaker_open(&self.name);
        metrics::set_circuit_breaker_state(&self.name, CircuitState::Open.gauge_value());
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    fn breaker(config: CircuitBreakerConfig) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = Arc::new(CircuitBreaker::new("store", config, clock.clone()));
        (cb, clock)
    }

    fn config(threshold: u32, open_ms: u64, half_open: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            threshold,
            Duration::from_millis(open_ms),
            half_open,
            Duration::from_secs(60),
        )
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        cb.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_calls() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_operation() {
        let (cb, _) = breaker(config(3, 30_000, 1));

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 1);

        let invoked = AtomicBool::new(false);
        let result = cb
            .execute(|| async {
                invoked.store(true, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(cb.requests_rejected(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_rethrown_to_caller() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        let err = cb
            .execute(|| async { Err::<(), _>("store down") })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Operation("store down")));
    }

    #[tokio::test]
    async fn test_stays_open_until_cooldown_elapses() {
        let (cb, clock) = breaker(config(1, 10_000, 1));
        fail(&cb).await;

        clock.advance(Duration::from_millis(9_999));
        assert!(succeed(&cb).await.unwrap_err().is_open());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let (cb, clock) = breaker(config(2, 10_000, 1));
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(10_000));

        // The state is only re-evaluated when a call arrives
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_single_failure_below_threshold_stays_half_open() {
        let (cb, clock) = breaker(config(2, 1_000, 1));
        fail(&cb).await;
        fail(&cb).await;
        clock.advance(Duration::from_millis(1_000));

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.half_open_in_flight(), 0);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 2);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_threshold_one() {
        let (cb, clock) = breaker(config(1, 1_000, 1));
        fail(&cb).await;
        clock.advance(Duration::from_millis(1_000));

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admission_cap() {
        let (cb, clock) = breaker(config(1, 1_000, 2));
        fail(&cb).await;
        clock.advance(Duration::from_millis(1_000));

        let mut releases = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let (started_tx, started_rx) = oneshot::channel::<()>();
            let (release_tx, release_rx) = oneshot::channel::<()>();
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
            }));
            started_rx.await.unwrap();
            releases.push(release_tx);
        }

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.half_open_in_flight(), 2);

        let invoked = AtomicBool::new(false);
        let third = cb
            .execute(|| async {
                invoked.store(true, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(third.unwrap_err().is_open());
        assert!(!invoked.load(Ordering::SeqCst));

        for release in releases {
            release.send(()).unwrap();
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_late_success_from_before_open_does_not_close() {
        let (cb, clock) = breaker(config(1, 1_000, 1));

        // Admitted while Closed, finishes only after the circuit went
        // Open and then HalfOpen
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
            })
        };
        started_rx.await.unwrap();

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(Duration::from_millis(1_000));

        // Start a trial so the circuit is HalfOpen with its slot taken
        let (trial_started_tx, trial_started_rx) = oneshot::channel::<()>();
        let (trial_release_tx, trial_release_rx) = oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = trial_started_tx.send(());
                    let _ = trial_release_rx.await;
                    Err::<(), _>("still down")
                })
                .await
            })
        };
        trial_started_rx.await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.half_open_in_flight(), 1);

        // The real trial decides
        trial_release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_dropped_trial_releases_slot() {
        let (cb, clock) = breaker(config(1, 1_000, 1));
        fail(&cb).await;
        clock.advance(Duration::from_millis(1_000));

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let cb_task = cb.clone();
        let handle = tokio::spawn(async move {
            cb_task
                .execute(|| async move {
                    let _ = started_tx.send(());
                    std::future::pending::<Result<(), &'static str>>().await
                })
                .await
        });
        started_rx.await.unwrap();
        assert_eq!(cb.half_open_in_flight(), 1);

        handle.abort();
        let _ = handle.await;
        assert_eq!(cb.half_open_in_flight(), 0);

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let (cb, _) = breaker(config(3, 30_000, 1));

        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.failure_count(), 0);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_recent_failures_respect_monitor_window() {
        let (cb, clock) = breaker(CircuitBreakerConfig::new(
            10,
            Duration::from_secs(30),
            1,
            Duration::from_millis(500),
        ));
        fail(&cb).await;
        clock.advance(Duration::from_millis(400));
        fail(&cb).await;
        assert_eq!(cb.recent_failures(), 2);

        clock.advance(Duration::from_millis(200));
        assert_eq!(cb.recent_failures(), 1);
        // Observability only: the consecutive counter is unaffected
        assert_eq!(cb.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_force_open_and_close() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }
}
