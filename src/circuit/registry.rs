use crate::circuit::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Lazily-populated map of one breaker per backend.
///
/// Breakers never share a lock; the map shard lock is only held while
/// looking up or inserting the `Arc`.
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Use a dedicated configuration for one backend.
    pub fn with_override(mut self, backend_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(backend_id.into(), config);
        self
    }

    pub fn breaker(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(backend_id) {
            return Arc::clone(existing.value());
        }
        let config = self
            .overrides
            .get(backend_id)
            .cloned()
            .unwrap_or_else(|| self.config.clone());
        Arc::clone(
            self.breakers
                .entry(backend_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(backend_id, config)))
                .value(),
        )
    }

    /// Current state; a backend never called is Closed.
    pub fn state(&self, backend_id: &str) -> CircuitState {
        self.breakers
            .get(backend_id)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, backend_id: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(backend_id).map(|breaker| breaker.snapshot())
    }

    pub fn reset(&self, backend_id: &str) {
        if let Some(breaker) = self.breakers.get(backend_id) {
            breaker.reset();
        }
    }

    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}
