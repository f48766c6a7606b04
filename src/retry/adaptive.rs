use crate::error::ErrorRecord;
use crate::retry::strategy::{RetryStrategy, honor_hint, permits_retry};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub window_size: usize,
    /// Samples required before the window influences behavior.
    pub min_samples: usize,
    /// Success rate below which retries are tightened.
    pub failure_threshold: f64,
    /// Success rate above which behavior relaxes toward the base strategy.
    pub success_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            min_samples: 5,
            failure_threshold: 0.5,
            success_threshold: 0.8,
        }
    }
}

#[derive(Debug)]
struct AdaptiveState {
    outcomes: VecDeque<bool>,
    delay_multiplier: f64,
    degraded: bool,
}

/// Self-tuning wrapper over a base strategy.
///
/// While the rolling success rate sits below `failure_threshold` the effective
/// attempt budget is halved and delays are doubled. Once it climbs above
/// `success_threshold` the multiplier decays back to 1.
#[derive(Debug)]
pub struct AdaptiveRetry<S> {
    base: S,
    config: AdaptiveConfig,
    state: Mutex<AdaptiveState>,
}

impl<S: RetryStrategy> AdaptiveRetry<S> {
    pub fn new(base: S, config: AdaptiveConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            base,
            config,
            state: Mutex::new(AdaptiveState {
                outcomes: VecDeque::with_capacity(capacity),
                delay_multiplier: 1.0,
                degraded: false,
            }),
        }
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    /// Rolling success rate, `None` until `min_samples` outcomes were seen.
    pub fn success_rate(&self) -> Option<f64> {
        let state = self.lock();
        Self::rate(&state.outcomes, self.config.min_samples)
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    pub fn delay_multiplier(&self) -> f64 {
        self.lock().delay_multiplier
    }

    fn rate(outcomes: &VecDeque<bool>, min_samples: usize) -> Option<f64> {
        if outcomes.is_empty() || outcomes.len() < min_samples {
            return None;
        }
        let successes = outcomes.iter().filter(|ok| **ok).count();
        Some(successes as f64 / outcomes.len() as f64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AdaptiveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn effective_max_attempts(&self, degraded: bool) -> u32 {
        let base = self.base.max_attempts();
        if degraded { (base / 2).max(1) } else { base }
    }
}

impl<S: RetryStrategy> RetryStrategy for AdaptiveRetry<S> {
    fn should_retry(&self, error: &ErrorRecord, attempt: u32) -> bool {
        let degraded = self.lock().degraded;
        permits_retry(error, attempt, self.effective_max_attempts(degraded))
            && self.base.should_retry(error, attempt)
    }

    fn delay(&self, attempt: u32, error: Option<&ErrorRecord>) -> Duration {
        let multiplier = self.lock().delay_multiplier;
        let delay = self.base.delay(attempt, error).mul_f64(multiplier);
        honor_hint(delay, error)
    }

    fn max_attempts(&self) -> u32 {
        self.effective_max_attempts(self.lock().degraded)
    }

    fn record_outcome(&self, success: bool) {
        let mut state = self.lock();
        let window = self.config.window_size.max(1);
        if state.outcomes.len() >= window {
            state.outcomes.pop_front();
        }
        state.outcomes.push_back(success);

        let Some(rate) = Self::rate(&state.outcomes, self.config.min_samples) else {
            return;
        };

        if rate < self.config.failure_threshold {
            if !state.degraded {
                debug!(success_rate = rate, "Adaptive retry tightening");
            }
            state.degraded = true;
            state.delay_multiplier = 2.0;
        } else if rate > self.config.success_threshold {
            state.degraded = false;
            state.delay_multiplier = (state.delay_multiplier * 0.5).max(1.0);
        }
    }
}
