use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent Open before a trial call is admitted.
    pub recovery_timeout: Duration,
    /// Concurrent trial calls admitted while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit is {state:?}, call rejected")]
pub struct CircuitOpenError {
    pub state: CircuitState,
    /// Remaining time until a trial call may be admitted, when Open.
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_in_flight: u32,
    pub transitions: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    state_changed_at: Instant,
    consecutive_failures: u32,
    half_open_in_flight: u32,
    /// Bumped on every transition; permits from an older generation are stale.
    generation: u64,
    rejected_calls: u64,
}

/// Per-backend Closed/Open/HalfOpen state machine.
///
/// All reads and transitions happen under one short, non-async lock owned by
/// this breaker only.
#[derive(Debug)]
pub struct CircuitBreaker {
    backend_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend_id: backend_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                state_changed_at: Instant::now(),
                consecutive_failures: 0,
                half_open_in_flight: 0,
                generation: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask permission to call the backend now.
    ///
    /// An Open breaker whose recovery timeout has elapsed moves to HalfOpen and
    /// the caller becomes a trial.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, CircuitOpenError> {
        let mut inner = self.lock();
        let now = Instant::now();

        if inner.state == CircuitState::Open {
            let elapsed = now.saturating_duration_since(inner.state_changed_at);
            if elapsed < self.config.recovery_timeout {
                inner.rejected_calls += 1;
                return Err(CircuitOpenError {
                    state: CircuitState::Open,
                    retry_in: Some(self.config.recovery_timeout - elapsed),
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        let trial = inner.state == CircuitState::HalfOpen;
        if trial {
            if inner.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                inner.rejected_calls += 1;
                return Err(CircuitOpenError {
                    state: CircuitState::HalfOpen,
                    retry_in: None,
                });
            }
            inner.half_open_in_flight += 1;
        }

        Ok(CircuitPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_in_flight: inner.half_open_in_flight,
            transitions: inner.generation,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Explicit operator reset back to Closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, Instant::now());
        } else {
            inner.consecutive_failures = 0;
        }
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let mut inner = self.lock();
        if generation != inner.generation {
            return;
        }
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.transition(&mut inner, CircuitState::Closed, Instant::now());
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64, trial: bool) {
        let mut inner = self.lock();
        if generation != inner.generation {
            return;
        }
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.transition(&mut inner, CircuitState::Open, Instant::now());
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.transition(&mut inner, CircuitState::Open, Instant::now());
                }
            }
            _ => {}
        }
    }

    fn on_release(&self, generation: u64, trial: bool) {
        let mut inner = self.lock();
        if trial && generation == inner.generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.state_changed_at = now;
        inner.consecutive_failures = 0;
        inner.half_open_in_flight = 0;
        inner.generation += 1;

        match to {
            CircuitState::Open => warn!(
                backend = %self.backend_id,
                ?from,
                recovery_timeout = ?self.config.recovery_timeout,
                "Circuit opened"
            ),
            CircuitState::Closed => info!(backend = %self.backend_id, ?from, "Circuit closed"),
            CircuitState::HalfOpen => debug!(backend = %self.backend_id, "Circuit half-open, admitting trial"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission ticket for one call. Settle it with the call's outcome.
///
/// Dropping an unsettled permit releases any trial slot without counting an
/// outcome, so cancelled calls never wedge a half-open breaker.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation, self.trial);
    }

    /// Give the slot back without reporting an outcome.
    pub fn release(self) {}
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.generation, self.trial);
        }
    }
}
