use crate::retry::strategy::{RetryConfig, RetryStrategy};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
enum StrategySource {
    Config(RetryConfig),
    Shared(Arc<dyn RetryStrategy>),
}

/// One retry strategy per backend, built lazily.
///
/// Adaptive state lives in the strategy, so a failing backend only tightens
/// its own retry budget.
#[derive(Debug)]
pub struct RetryRegistry {
    source: StrategySource,
    strategies: DashMap<String, Arc<dyn RetryStrategy>>,
}

impl RetryRegistry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            source: StrategySource::Config(config),
            strategies: DashMap::new(),
        }
    }

    /// Hand the same instance to every backend. Meant for stateless strategies.
    pub fn shared(strategy: Arc<dyn RetryStrategy>) -> Self {
        Self {
            source: StrategySource::Shared(strategy),
            strategies: DashMap::new(),
        }
    }

    pub fn strategy(&self, backend_id: &str) -> Arc<dyn RetryStrategy> {
        let config = match &self.source {
            StrategySource::Shared(strategy) => return Arc::clone(strategy),
            StrategySource::Config(config) => config,
        };
        if let Some(existing) = self.strategies.get(backend_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.strategies
                .entry(backend_id.to_string())
                .or_insert_with(|| config.build())
                .value(),
        )
    }

    /// Drop a backend's learned state; the next call starts from the base strategy.
    pub fn reset(&self, backend_id: &str) {
        self.strategies.remove(backend_id);
    }
}
