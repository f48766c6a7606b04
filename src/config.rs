//! Engine-wide configuration.
//!
//! Every tuning constant of the engine lives here so embedding processes can
//! override them from TOML without code changes.

use crate::capability::{CacheConfig, ComparisonWeights, ProbeConfig};
use crate::circuit::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::selection::SelectionConfig;
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-backend breaker settings that replace `circuit_breaker`.
    pub circuit_overrides: HashMap<String, CircuitBreakerConfig>,
    pub cache: CacheConfig,
    pub probe: ProbeConfig,
    pub selection: SelectionConfig,
    pub comparison: ComparisonWeights,
    /// Upper bound on a single attempt; `None` leaves only the caller deadline.
    pub attempt_timeout: Option<Duration>,
    /// How long a backend stays deprioritized after rate-limit retries ran out.
    pub rate_limit_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            circuit_overrides: HashMap::new(),
            cache: CacheConfig::default(),
            probe: ProbeConfig::default(),
            selection: SelectionConfig::default(),
            comparison: ComparisonWeights::default(),
            attempt_timeout: Some(Duration::from_secs(120)),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.retry.max_attempts >= 1, "retry.max_attempts must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.retry.jitter),
            "retry.jitter must be within [0, 1], got {}",
            self.retry.jitter
        );
        ensure!(
            self.retry.base_delay <= self.retry.cap_delay,
            "retry.base_delay must not exceed retry.cap_delay"
        );
        for (name, breaker) in std::iter::once(("default", &self.circuit_breaker))
            .chain(self.circuit_overrides.iter().map(|(id, c)| (id.as_str(), c)))
        {
            ensure!(
                breaker.failure_threshold >= 1,
                "circuit breaker '{}': failure_threshold must be at least 1",
                name
            );
            ensure!(
                breaker.half_open_max_calls >= 1,
                "circuit breaker '{}': half_open_max_calls must be at least 1",
                name
            );
        }
        ensure!(self.cache.max_size >= 1, "cache.max_size must be at least 1");
        ensure!(
            !self.probe.refresh_interval.is_zero(),
            "probe.refresh_interval must be positive"
        );
        ensure!(
            (0.0..=1.0).contains(&self.probe.drift_threshold),
            "probe.drift_threshold must be within [0, 1]"
        );

        let weights = &self.selection.weights;
        ensure!(
            [
                weights.performance_weight,
                weights.cost_weight,
                weights.feature_weight,
                weights.compliance_weight,
            ]
            .iter()
            .all(|w| w.is_finite() && *w >= 0.0),
            "selection.weights must be finite and non-negative"
        );
        ensure!(
            (0.0..=1.0).contains(&self.selection.priority_boost),
            "selection.priority_boost must be within [0, 1]"
        );
        let performance = &self.selection.performance;
        ensure!(
            [performance.latency, performance.throughput, performance.uptime]
                .iter()
                .all(|w| w.is_finite() && *w >= 0.0),
            "selection.performance weights must be finite and non-negative"
        );
        ensure!(
            (0.0..=1.0).contains(&performance.unmeasured_uptime_factor),
            "selection.performance.unmeasured_uptime_factor must be within [0, 1]"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");

        let mut config = EngineConfig::default();
        config.circuit_breaker.failure_threshold = 7;
        config.circuit_overrides.insert(
            "flaky".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        config.to_toml_file(&path).unwrap();

        let loaded = EngineConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.circuit_breaker.failure_threshold, 7);
        assert_eq!(loaded.circuit_overrides["flaky"].failure_threshold, 2);
        assert_eq!(loaded.selection, config.selection);
        assert_eq!(loaded.probe.confidence, config.probe.confidence);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [circuit_breaker]
            failure_threshold = 3
            half_open_max_calls = 2
            recovery_timeout = { secs = 10, nanos = 0 }
            "#,
        )
        .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.half_open_max_calls, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, RetryConfig::default().max_attempts);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [circuit_breaker]
            failure_threshold = 0
            half_open_max_calls = 1
            recovery_timeout = { secs = 10, nanos = 0 }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));

        assert!(EngineConfig::from_toml_str("not = [valid").is_err());
    }
}
