//! Rate limiter front-end used by the pipeline stages.
//!
//! # Fail-closed policy
//!
//! In distributed mode every check goes through the counter-store circuit
//! breaker with a per-call timeout. If the breaker is open, the store errors,
//! or the call times out, the decision is [`RateLimitOutcome::Unavailable`]
//! (rendered as 503) and never an allow. An attacker who can make the store
//! misbehave must not gain an unlimited budget from it.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{debug, warn};

use super::decision::{RateLimitDecision, RateLimitOutcome};
use super::key::RateLimitKey;
use super::local::LocalRateLimiter;
use super::profile::{ProfileName, RateLimitProfiles};
use super::store::{CounterSnapshot, CounterStore, StoreError};
use crate::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerRegistry};
use crate::clock::SharedClock;
use crate::metrics;

/// Registry name of the breaker guarding the counter store.
pub const STORE_BREAKER_NAME: &str = "counter-store";

/// Retry hint returned with fail-closed decisions.
pub const FAIL_CLOSED_RETRY_AFTER_SECS: u64 = 60;

enum Backend {
    /// Shared store behind a breaker. The local limiter only absorbs
    /// penalties the store could not record.
    Distributed {
        store: Arc<dyn CounterStore>,
        breaker: Arc<CircuitBreaker>,
        store_timeout: Duration,
        penalty_fallback: LocalRateLimiter,
    },
    /// Process-local counters only.
    InProcess(LocalRateLimiter),
}

/// Per-key, per-profile admission decisions.
pub struct RateLimiter {
    profiles: RateLimitProfiles,
    clock: SharedClock,
    backend: Backend,
}

impl RateLimiter {
    /// Limiter backed by a shared counter store.
    ///
    /// The store breaker is fetched from `registry` so `/ready` can report
    /// its state.
    pub fn distributed(
        profiles: RateLimitProfiles,
        store: Arc<dyn CounterStore>,
        registry: &CircuitBreakerRegistry,
        store_timeout: Duration,
        clock: SharedClock,
    ) -> Self {
        let penalty_fallback = LocalRateLimiter::new(&profiles, clock.clone());
        Self {
            backend: Backend::Distributed {
                store,
                breaker: registry.get(STORE_BREAKER_NAME),
                store_timeout,
                penalty_fallback,
            },
            profiles,
            clock,
        }
    }

    /// Limiter with process-local counters only.
    pub fn in_process(profiles: RateLimitProfiles, clock: SharedClock) -> Self {
        Self {
            backend: Backend::InProcess(LocalRateLimiter::new(&profiles, clock.clone())),
            profiles,
            clock,
        }
    }

    pub fn profiles(&self) -> &RateLimitProfiles {
        &self.profiles
    }

    /// `"distributed"` or `"in_process"`.
    pub fn mode(&self) -> &'static str {
        match self.backend {
            Backend::Distributed { .. } => "distributed",
            Backend::InProcess(_) => "in_process",
        }
    }

    /// Name of the counting backend (`redis`, `memory`, `governor`).
    pub fn backend(&self) -> &'static str {
        match &self.backend {
            Backend::Distributed { store, .. } => store.backend(),
            Backend::InProcess(_) => "governor",
        }
    }

    /// Consume one point for `key` against `profile`.
    pub async fn check(&self, key: &RateLimitKey, profile: ProfileName) -> RateLimitDecision {
        let decision = match &self.backend {
            Backend::InProcess(local) => local.check(key.as_str(), profile),
            Backend::Distributed {
                store,
                breaker,
                store_timeout,
                ..
            } => {
                let window = self.profiles.get(profile).window;
                match self
                    .increment(store.as_ref(), breaker, *store_timeout, key, profile, 1, window)
                    .await
                {
                    Ok(snapshot) => self.decide(profile, snapshot),
                    Err(e) => {
                        warn!(
                            key = %key,
                            profile = %profile,
                            error = %e,
                            "Counter store unavailable, denying request"
                        );
                        self.unavailable(profile)
                    }
                }
            }
        };

        metrics::record_rate_limit_decision(profile.as_str(), decision.outcome.as_str());
        decision
    }

    /// Record a failed credential check for `key`.
    ///
    /// Consumes `points` against the FAILED_AUTH budget and returns that
    /// decision; a `Limited` outcome means the key has used up its failed
    /// attempts for the window. The triggering profile's counter is charged
    /// too, with the FAILED_AUTH block duration as its expiry rather than
    /// the triggering profile's own window.
    ///
    /// Best-effort: store failures fall back to the in-process counters and
    /// are only logged. `None` when `points` is zero.
    pub async fn penalize(
        &self,
        key: &RateLimitKey,
        profile: ProfileName,
        points: u32,
    ) -> Option<RateLimitDecision> {
        if points == 0 {
            return None;
        }

        let (outcome, decision) = match &self.backend {
            Backend::InProcess(local) => (
                "applied",
                self.penalize_locally(local, key, profile, points),
            ),
            Backend::Distributed {
                store,
                breaker,
                store_timeout,
                penalty_fallback,
            } => match self
                .record_failure(store.as_ref(), breaker, *store_timeout, key, profile, points)
                .await
            {
                Ok(snapshot) => ("applied", self.decide(ProfileName::FailedAuth, snapshot)),
                Err(e) => {
                    warn!(
                        key = %key,
                        profile = %profile,
                        error = %e,
                        "Failed to record auth penalty in counter store, using local counters"
                    );
                    (
                        "fallback",
                        self.penalize_locally(penalty_fallback, key, profile, points),
                    )
                }
            },
        };

        debug!(
            key = %key,
            profile = %profile,
            points,
            outcome,
            failed_auth_remaining = decision.remaining,
            "Auth penalty processed"
        );
        metrics::record_penalty(outcome);
        Some(decision)
    }

    fn penalize_locally(
        &self,
        local: &LocalRateLimiter,
        key: &RateLimitKey,
        profile: ProfileName,
        points: u32,
    ) -> RateLimitDecision {
        if profile != ProfileName::FailedAuth {
            local.penalize(key.as_str(), profile, points);
        }
        local.consume(key.as_str(), ProfileName::FailedAuth, points)
    }

    /// Store side of [`penalize`](Self::penalize): the triggering profile
    /// first, then the FAILED_AUTH counter whose snapshot is returned.
    async fn record_failure(
        &self,
        store: &dyn CounterStore,
        breaker: &CircuitBreaker,
        store_timeout: Duration,
        key: &RateLimitKey,
        profile: ProfileName,
        points: u32,
    ) -> Result<CounterSnapshot, BreakerError<StoreError>> {
        let failed_auth = &self.profiles.failed_auth;
        if profile != ProfileName::FailedAuth {
            self.increment(
                store,
                breaker,
                store_timeout,
                key,
                profile,
                points,
                failed_auth.block_duration,
            )
            .await?;
        }
        self.increment(
            store,
            breaker,
            store_timeout,
            key,
            ProfileName::FailedAuth,
            points,
            failed_auth.window,
        )
        .await
    }

    /// Drop idle in-process buckets and expired store windows.
    ///
    /// Returns the number of store windows removed.
    pub fn retain_recent(&self) -> usize {
        match &self.backend {
            Backend::InProcess(local) => {
                local.retain_recent();
                0
            }
            Backend::Distributed {
                store,
                penalty_fallback,
                ..
            } => {
                penalty_fallback.retain_recent();
                store.purge_expired()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn increment(
        &self,
        store: &dyn CounterStore,
        breaker: &CircuitBreaker,
        store_timeout: Duration,
        key: &RateLimitKey,
        profile: ProfileName,
        points: u32,
        ttl: Duration,
    ) -> Result<CounterSnapshot, BreakerError<StoreError>> {
        let store_key = format!("{profile}:{key}");
        breaker
            .execute(|| async move {
                tokio::time::timeout(store_timeout, store.increment(&store_key, points, ttl))
                    .await
                    .map_err(|_| StoreError::Timeout(store_timeout))?
            })
            .await
    }

    fn decide(&self, profile: ProfileName, snapshot: CounterSnapshot) -> RateLimitDecision {
        let config = self.profiles.get(profile);
        let reset_at = self.clock.now_utc()
            + TimeDelta::from_std(snapshot.ttl_remaining).unwrap_or(TimeDelta::zero());
        let limit = u64::from(config.points);

        if snapshot.count > limit {
            RateLimitDecision {
                profile,
                limit: config.points,
                outcome: RateLimitOutcome::Limited,
                remaining: 0,
                reset_at,
                retry_after_secs: Some(config.window_retry_after_secs()),
            }
        } else {
            RateLimitDecision {
                profile,
                limit: config.points,
                outcome: RateLimitOutcome::Allowed,
                remaining: u32::try_from(limit - snapshot.count).unwrap_or(u32::MAX),
                reset_at,
                retry_after_secs: None,
            }
        }
    }

    fn unavailable(&self, profile: ProfileName) -> RateLimitDecision {
        let retry = FAIL_CLOSED_RETRY_AFTER_SECS;
        RateLimitDecision {
            profile,
            limit: self.profiles.get(profile).points,
            outcome: RateLimitOutcome::Unavailable,
            remaining: 0,
            reset_at: self.clock.now_utc() + TimeDelta::seconds(retry as i64),
            retry_after_secs: Some(retry),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("mode", &self.mode())
            .field("backend", &self.backend())
            .finish()
    }
}
