//! In-process rate limiting for single-instance deployments.
//!
//! Uses the Governor crate's Generic Cell Rate Algorithm (a token bucket
//! metered per key). Each profile gets its own keyed limiter with a burst of
//! `points` refilled evenly over `window`. Buckets are metered on the
//! injected [`SharedClock`], the same time source as the rest of the limiter.
//!
//! # Scaling Limitation
//!
//! Counters live in this process only. Behind a load balancer with N
//! instances a client effectively gets N times the configured budget. This
//! mode is selected only by `DISTRIBUTED_STORE_ENABLED=false`; it is never
//! switched on automatically when the shared store is slow or down.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use chrono::TimeDelta;
use governor::clock::Clock as GovernorClockTrait;
use governor::middleware::StateInformationMiddleware;
use governor::nanos::Nanos;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use tracing::{debug, warn};

use super::decision::{RateLimitDecision, RateLimitOutcome};
use super::profile::{ProfileName, RateLimitProfile, RateLimitProfiles};
use crate::clock::SharedClock;

/// Governor clock reading from a [`SharedClock`].
#[derive(Debug, Clone)]
struct GovernorClock(SharedClock);

impl GovernorClockTrait for GovernorClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(self.0.now_millis().saturating_mul(1_000_000))
    }
}

/// Per-key GCRA limiter that reports remaining capacity.
type KeyedLimiter = GovernorLimiter<
    String,
    DefaultKeyedStateStore<String>,
    GovernorClock,
    StateInformationMiddleware,
>;

struct ProfileLimiter {
    limiter: KeyedLimiter,
    points: u32,
    /// Time to regain one point.
    period: Duration,
}

/// In-process limiter holding one governor instance per profile.
pub struct LocalRateLimiter {
    limiters: HashMap<ProfileName, ProfileLimiter>,
    clock: GovernorClock,
}

impl LocalRateLimiter {
    /// Build limiters for every profile.
    ///
    /// Profiles with zero points or a zero window are skipped (config
    /// validation rejects them before this point).
    pub fn new(profiles: &RateLimitProfiles, clock: SharedClock) -> Self {
        let clock = GovernorClock(clock);
        let limiters = profiles
            .iter()
            .filter_map(|profile| {
                let built = Self::build(profile, &clock);
                if built.is_none() {
                    warn!(profile = %profile.name, "Skipping in-process limiter for empty profile");
                }
                built.map(|limiter| (profile.name, limiter))
            })
            .collect();

        Self { limiters, clock }
    }

    fn build(profile: &RateLimitProfile, clock: &GovernorClock) -> Option<ProfileLimiter> {
        let burst = NonZeroU32::new(profile.points)?;
        let period = profile.window / profile.points;
        let quota = Quota::with_period(period)?.allow_burst(burst);

        Some(ProfileLimiter {
            limiter: GovernorLimiter::new(quota, DefaultKeyedStateStore::default(), clock.clone()),
            points: profile.points,
            period,
        })
    }

    /// Consume one point for `key` against `profile`.
    pub fn check(&self, key: &str, profile: ProfileName) -> RateLimitDecision {
        self.consume(key, profile, 1)
    }

    /// Consume `points` (at least one) for `key` against `profile`.
    ///
    /// All-or-nothing: a denied charge leaves the bucket untouched.
    pub fn consume(&self, key: &str, profile: ProfileName, points: u32) -> RateLimitDecision {
        let now = self.clock.0.now_utc();
        let Some(entry) = self.limiters.get(&profile) else {
            // Unreachable with validated configuration; never fail open.
            return RateLimitDecision {
                profile,
                limit: 0,
                outcome: RateLimitOutcome::Limited,
                remaining: 0,
                reset_at: now,
                retry_after_secs: Some(1),
            };
        };
        let n = NonZeroU32::new(points).unwrap_or(NonZeroU32::MIN);

        let wait = match entry.limiter.check_key_n(&key.to_string(), n) {
            Ok(Ok(snapshot)) => {
                let remaining = snapshot.remaining_burst_capacity();
                let refill = entry.period * entry.points.saturating_sub(remaining);
                return RateLimitDecision {
                    profile,
                    limit: entry.points,
                    outcome: RateLimitOutcome::Allowed,
                    remaining,
                    reset_at: now + TimeDelta::from_std(refill).unwrap_or(TimeDelta::zero()),
                    retry_after_secs: None,
                };
            }
            Ok(Err(not_until)) => not_until.wait_time_from(self.clock.now()),
            // More points than the bucket can ever hold
            Err(_) => entry.period * entry.points,
        };

        let retry_after = wait.as_secs().max(1);
        debug!(key, profile = %profile, retry_after, "In-process rate limit exceeded");
        RateLimitDecision {
            profile,
            limit: entry.points,
            outcome: RateLimitOutcome::Limited,
            remaining: 0,
            reset_at: now + TimeDelta::from_std(wait).unwrap_or(TimeDelta::zero()),
            retry_after_secs: Some(retry_after),
        }
    }

    /// Charge `points` extra points to `key` against `profile`.
    ///
    /// When the bucket cannot absorb the whole charge, whatever capacity is
    /// left is drained instead. Returns `false` only if nothing could be
    /// charged (unknown profile or zero points).
    pub fn penalize(&self, key: &str, profile: ProfileName, points: u32) -> bool {
        let (Some(entry), Some(n)) = (self.limiters.get(&profile), NonZeroU32::new(points)) else {
            return false;
        };
        let key = key.to_string();
        if matches!(entry.limiter.check_key_n(&key, n), Ok(Ok(_))) {
            return true;
        }

        let mut drained = 0;
        while drained < points && entry.limiter.check_key(&key).is_ok() {
            drained += 1;
        }
        debug!(key, profile = %profile, points, drained, "Penalty exceeded bucket capacity, drained");
        true
    }

    /// Forget keys whose buckets have fully refilled.
    pub fn retain_recent(&self) {
        for entry in self.limiters.values() {
            entry.limiter.retain_recent();
        }
    }
}

impl std::fmt::Debug for LocalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRateLimiter")
            .field("profiles", &self.limiters.keys().collect::<Vec<_>>())
            .finish()
    }
}
