//! Shared application state for Axum handlers.
//!
//! This module is the construction root. It wires:
//!
//! - **Circuit breakers**: one registry shared by every component
//! - **Rate limiter**: distributed (Redis) or in-process, chosen once at startup
//! - **Pipeline**: the admission stages in reference order, ending in the
//!   business handler
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken` for proper lifecycle management. Call `shutdown()`
//! to gracefully stop all background tasks before application exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::handlers::EchoHandler;
use crate::middleware::{
    AuthenticationStage, AuthorizationStage, ContentTypeStage, CorsStage, CsrfStage, HttpsStage,
    RateLimitStage, StaticTokenVerifier, TokenVerifier, TrustedProxyConfig,
};
use crate::pipeline::{BusinessHandler, Pipeline};
use crate::rate_limit::{CounterStore, ProfileName, RateLimiter, RedisCounterStore, StoreError};

/// Interval of the housekeeping task.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Replaceable collaborators of the pipeline.
///
/// `store: None` selects the in-process limiter.
pub struct Collaborators {
    pub clock: SharedClock,
    pub store: Option<Arc<dyn CounterStore>>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub handler: Arc<dyn BusinessHandler>,
}

/// Shared application state for Axum handlers.
///
/// This struct is cloned for each request handler. All internal data
/// is wrapped in `Arc` for efficient sharing.
///
/// # Lifecycle
///
/// The housekeeping task is spawned when the state is created. Call
/// `shutdown()` before dropping to ensure clean task termination:
///
/// ```rust,ignore
/// let state = AppState::connect(config).await?;
/// // ... use state ...
/// state.shutdown().await;  // Wait for background tasks to complete
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Circuit breakers shared by every component
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Rate limiter shared by the rate-limit and authentication stages
    pub limiter: Arc<RateLimiter>,
    /// Admission pipeline serving every non-probe route
    pub pipeline: Arc<Pipeline>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the production state: system clock, Redis counters when the
    /// distributed store is enabled, static bearer tokens from `AUTH_TOKENS`
    /// and the echo handler.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if Redis cannot be reached.
    pub async fn connect(config: Config) -> Result<Self, StoreError> {
        let store: Option<Arc<dyn CounterStore>> =
            match (&config.redis_url, config.distributed_store_enabled) {
                (Some(url), true) => Some(Arc::new(RedisCounterStore::connect(url).await?)),
                (None, true) => {
                    return Err(StoreError::Unavailable(
                        "distributed store enabled without REDIS_URL".to_string(),
                    ));
                }
                (_, false) => None,
            };

        let verifier = StaticTokenVerifier::new(config.auth_tokens.clone());
        if verifier.is_empty() {
            info!("AUTH_TOKENS is empty: every protected request will be rejected with 401");
        }

        Ok(Self::with_collaborators(
            config,
            Collaborators {
                clock: Arc::new(SystemClock),
                store,
                verifier: Arc::new(verifier),
                handler: Arc::new(EchoHandler),
            },
        ))
    }

    /// Build the state around the given collaborators.
    ///
    /// Must be called inside a Tokio runtime: the housekeeping task is
    /// spawned immediately.
    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            clock,
            store,
            verifier,
            handler,
        } = collaborators;

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let profiles = config.rate_limit_profiles.clone();
        let limiter = Arc::new(match store {
            Some(store) => RateLimiter::distributed(
                profiles,
                store,
                &breakers,
                config.store_timeout,
                clock.clone(),
            ),
            None => RateLimiter::in_process(profiles, clock.clone()),
        });
        info!(
            mode = limiter.mode(),
            backend = limiter.backend(),
            "Rate limiter configured"
        );

        let trusted_proxies = Arc::new(TrustedProxyConfig::new(&config.trusted_proxies));
        let enforce_https = config.enforce_https();
        if enforce_https {
            info!(environment = %config.environment, "HTTPS enforcement enabled");
        }

        let pipeline = Pipeline::builder(handler)
            .clock(clock.clone())
            .max_body_size(config.max_request_body_size)
            .stage(CorsStage::new(config.allowed_origins.clone()))
            .stage(HttpsStage::new(enforce_https))
            .stage(RateLimitStage::new(
                limiter.clone(),
                ProfileName::Api,
                trusted_proxies.clone(),
            ))
            .stage(ContentTypeStage::new())
            .stage(AuthenticationStage::new(
                verifier,
                limiter.clone(),
                trusted_proxies,
                ProfileName::Api,
            ))
            .stage(AuthorizationStage::new())
            .stage(CsrfStage::new(clock))
            .build();
        info!(stages = ?pipeline.stage_names(), "Admission pipeline built");

        let state = Self {
            config: Arc::new(config),
            breakers,
            limiter,
            pipeline: Arc::new(pipeline),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_housekeeping_task(HOUSEKEEPING_INTERVAL);

        state
    }

    /// Spawn the periodic cleanup of idle limiter state.
    ///
    /// The task is tracked by `task_tracker` and respects `cancellation_token`
    /// for graceful shutdown.
    fn spawn_housekeeping_task(&self, period: Duration) {
        let limiter = self.limiter.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Housekeeping task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = limiter.retain_recent();
                        trace!(purged, "Rate limiter housekeeping completed");
                    }
                }
            }

            debug!("Housekeeping task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// This method:
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        // Signal all tasks to stop
        self.cancellation_token.cancel();

        // Close the tracker - no new tasks can be spawned
        self.task_tracker.close();

        // Wait for all tasks to complete
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
