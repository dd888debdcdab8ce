//! Process-wide registry of named circuit breakers.
//!
//! Breakers are created lazily on first use and then shared by every
//! concurrent request. The registry is owned by the application state and
//! passed by reference into the stages that need it; there is no global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::SharedClock;

/// Keyed registry of circuit breakers sharing one configuration and clock.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Current state of every breaker created so far, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Every breaker created so far, sorted by name.
    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = breakers.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Whether any registered breaker is currently open.
    pub fn any_open(&self) -> bool {
        self.snapshot()
            .iter()
            .any(|(_, state)| *state == CircuitState::Open)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[test]
    fn test_same_name_returns_shared_instance() {
        let registry = registry();
        let a = registry.get("redis");
        let b = registry.get("redis");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_different_names_are_independent() {
        let registry = registry();
        let a = registry.get("redis");
        let b = registry.get("other");
        assert!(!Arc::ptr_eq(&a, &b));

        a.force_open();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(registry.any_open());
    }

    #[test]
    fn test_snapshot_lists_created_breakers() {
        let registry = registry();
        assert!(registry.snapshot().is_empty());

        registry.get("b");
        registry.get("a");
        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot,
            vec![
                ("a".to_string(), CircuitState::Closed),
                ("b".to_string(), CircuitState::Closed)
            ]
        );
    }
}
