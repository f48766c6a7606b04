use crate::error::ErrorRecord;
use crate::retry::adaptive::{AdaptiveConfig, AdaptiveRetry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of asking a strategy what to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    pub attempts_remaining: u32,
}

/// Decides whether and when a failed call is re-attempted.
///
/// `attempt` is the 1-based number of the attempt that just failed.
pub trait RetryStrategy: Send + Sync + std::fmt::Debug {
    fn should_retry(&self, error: &ErrorRecord, attempt: u32) -> bool;

    fn delay(&self, attempt: u32, error: Option<&ErrorRecord>) -> Duration;

    fn max_attempts(&self) -> u32;

    /// Feedback hook for strategies that tune themselves. No-op by default.
    fn record_outcome(&self, _success: bool) {}

    fn decide(&self, error: &ErrorRecord, attempt: u32) -> RetryDecision {
        let should_retry = self.should_retry(error, attempt);
        RetryDecision {
            should_retry,
            delay: if should_retry {
                self.delay(attempt, Some(error))
            } else {
                Duration::ZERO
            },
            attempts_remaining: self.max_attempts().saturating_sub(attempt),
        }
    }
}

/// Shared retry gate: category-aware and bounded by `max_attempts`.
pub(crate) fn permits_retry(error: &ErrorRecord, attempt: u32, max_attempts: u32) -> bool {
    error.is_retryable() && attempt < max_attempts
}

/// A rate-limit hint is a floor, never shortened by configuration.
pub(crate) fn honor_hint(delay: Duration, error: Option<&ErrorRecord>) -> Duration {
    match error.and_then(ErrorRecord::retry_after_hint) {
        Some(hint) => delay.max(hint),
        None => delay,
    }
}

/// Uniform ±`fraction` perturbation, clamped at `cap`.
pub(crate) fn jittered(delay: Duration, fraction: f64, cap: Duration) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    let delay = if fraction > 0.0 && !delay.is_zero() {
        let factor = 1.0 + rand::rng().random_range(-fraction..=fraction);
        delay.mul_f64(factor.max(0.0))
    } else {
        delay
    };
    delay.min(cap)
}

/// `min(base * 2^(attempt-1), cap)` with symmetric jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub cap_delay: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, cap_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            cap_delay,
            jitter: 0.0,
            max_attempts,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap_delay)
            .min(self.cap_delay)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, error: &ErrorRecord, attempt: u32) -> bool {
        permits_retry(error, attempt, self.max_attempts)
    }

    fn delay(&self, attempt: u32, error: Option<&ErrorRecord>) -> Duration {
        let delay = jittered(self.nominal(attempt), self.jitter, self.cap_delay);
        honor_hint(delay, error)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// `min(base + increment * (attempt-1), cap)` with optional jitter.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub base_delay: Duration,
    pub increment: Duration,
    pub cap_delay: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl LinearBackoff {
    pub fn new(base_delay: Duration, increment: Duration, cap_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            increment,
            cap_delay,
            jitter: 0.0,
            max_attempts,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

impl RetryStrategy for LinearBackoff {
    fn should_retry(&self, error: &ErrorRecord, attempt: u32) -> bool {
        permits_retry(error, attempt, self.max_attempts)
    }

    fn delay(&self, attempt: u32, error: Option<&ErrorRecord>) -> Duration {
        let steps = attempt.saturating_sub(1);
        let nominal = self
            .increment
            .checked_mul(steps)
            .and_then(|extra| self.base_delay.checked_add(extra))
            .unwrap_or(self.cap_delay)
            .min(self.cap_delay);
        honor_hint(jittered(nominal, self.jitter, self.cap_delay), error)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Constant delay regardless of attempt.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self { delay, max_attempts }
    }
}

impl RetryStrategy for FixedDelay {
    fn should_retry(&self, error: &ErrorRecord, attempt: u32) -> bool {
        permits_retry(error, attempt, self.max_attempts)
    }

    fn delay(&self, _attempt: u32, error: Option<&ErrorRecord>) -> Duration {
        honor_hint(self.delay, error)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategyKind {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub strategy: RetryStrategyKind,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
    /// Linear step; ignored by the other strategies.
    pub increment: Duration,
    /// Fraction in [0, 1] applied as a uniform ± perturbation.
    pub jitter: f64,
    /// Wrap the strategy in [`AdaptiveRetry`] when set.
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyKind::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            cap_delay: Duration::from_secs(60),
            increment: Duration::from_secs(1),
            jitter: 0.1,
            adaptive: Some(AdaptiveConfig::default()),
        }
    }
}

impl RetryConfig {
    /// Build the configured strategy.
    pub fn build(&self) -> Arc<dyn RetryStrategy> {
        let max_attempts = self.max_attempts.max(1);
        match (&self.adaptive, self.strategy) {
            (Some(adaptive), RetryStrategyKind::Exponential) => {
                Arc::new(AdaptiveRetry::new(self.exponential(max_attempts), adaptive.clone()))
            }
            (Some(adaptive), RetryStrategyKind::Linear) => {
                Arc::new(AdaptiveRetry::new(self.linear(max_attempts), adaptive.clone()))
            }
            (Some(adaptive), RetryStrategyKind::Fixed) => Arc::new(AdaptiveRetry::new(
                FixedDelay::new(self.base_delay, max_attempts),
                adaptive.clone(),
            )),
            (None, RetryStrategyKind::Exponential) => Arc::new(self.exponential(max_attempts)),
            (None, RetryStrategyKind::Linear) => Arc::new(self.linear(max_attempts)),
            (None, RetryStrategyKind::Fixed) => Arc::new(FixedDelay::new(self.base_delay, max_attempts)),
        }
    }

    fn exponential(&self, max_attempts: u32) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, self.cap_delay, max_attempts).with_jitter(self.jitter)
    }

    fn linear(&self, max_attempts: u32) -> LinearBackoff {
        LinearBackoff::new(self.base_delay, self.increment, self.cap_delay, max_attempts)
            .with_jitter(self.jitter)
    }
}
