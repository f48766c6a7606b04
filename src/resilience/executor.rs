use crate::circuit::CircuitRegistry;
use crate::error::{DispatchError, ErrorKind, ErrorRecord, RawFailure, classify};
use crate::resilience::metrics::MetricsRegistry;
use crate::retry::RetryRegistry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The only component that calls a backend: breaker gate, classification and
/// retry around one logical operation.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    circuits: Arc<CircuitRegistry>,
    retries: Arc<RetryRegistry>,
    metrics: Arc<MetricsRegistry>,
    attempt_timeout: Option<Duration>,
}

impl ResilientExecutor {
    pub fn new(
        circuits: Arc<CircuitRegistry>,
        retries: Arc<RetryRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            circuits,
            retries,
            metrics,
            attempt_timeout: None,
        }
    }

    /// Bound every single attempt; an attempt running longer counts as a Timeout.
    pub fn with_attempt_timeout(mut self, attempt_timeout: Option<Duration>) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn retries(&self) -> &Arc<RetryRegistry> {
        &self.retries
    }

    /// Run `operation` against `backend_id` until it succeeds, the strategy
    /// gives up, the circuit refuses, or `deadline` passes.
    ///
    /// The breaker is consulted before every attempt. A refusal fails fast
    /// with `CircuitOpen` and is not counted as an attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        backend_id: &str,
        deadline: Option<Instant>,
        mut operation: F,
    ) -> Result<T, ErrorRecord>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        let breaker = self.circuits.breaker(backend_id);
        let strategy = self.retries.strategy(backend_id);
        let mut attempt: u32 = 0;

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.surface(ErrorRecord::deadline_exceeded(backend_id, attempt)));
            }

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(rejection) => {
                    self.metrics.record_rejection(backend_id);
                    let mut record = ErrorRecord::circuit_open(backend_id)
                        .with_context("state", format!("{:?}", rejection.state))
                        .with_context("attempts", attempt);
                    if let Some(retry_in) = rejection.retry_in {
                        record = record.with_context("retry_in_ms", retry_in.as_millis() as u64);
                    }
                    debug!(backend = backend_id, attempt, "Call rejected by open circuit");
                    return Err(record);
                }
            };
            attempt += 1;

            let started = Instant::now();
            let outcome = match self.run_attempt(&mut operation, deadline).await {
                Some(outcome) => outcome,
                None => {
                    // Caller's deadline hit mid-call: release without an outcome.
                    permit.release();
                    return Err(self.surface(ErrorRecord::deadline_exceeded(backend_id, attempt)));
                }
            };

            let failure = match outcome {
                Ok(value) => {
                    permit.record_success();
                    strategy.record_outcome(true);
                    self.metrics.record_success(backend_id, started.elapsed());
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let record = classify(backend_id, &failure).with_context("attempt", attempt);
            if record.kind().counts_toward_circuit() {
                permit.record_failure();
                strategy.record_outcome(false);
            } else {
                permit.release();
            }
            self.metrics.record_failure(backend_id, &record);

            if !strategy.should_retry(&record, attempt) {
                if record.kind() == ErrorKind::Authentication {
                    warn!(backend = backend_id, error = %record, "Authentication failure, not retrying");
                } else {
                    debug!(backend = backend_id, attempt, kind = %record.kind(), "Giving up");
                }
                return Err(self.surface(record));
            }

            let delay = strategy.delay(attempt, Some(&record));
            if let Some(deadline) = deadline
                && Instant::now() + delay >= deadline
            {
                debug!(backend = backend_id, attempt, ?delay, "Retry delay would pass deadline");
                return Err(self.surface(
                    ErrorRecord::deadline_exceeded(backend_id, attempt)
                        .with_context("last_error", record.to_string()),
                ));
            }

            debug!(
                backend = backend_id,
                attempt,
                kind = %record.kind(),
                ?delay,
                "Retrying after failure"
            );
            self.metrics.record_retry(backend_id);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run the primary to exhaustion, then the fallback. Both errors are kept.
    pub async fn execute_with_fallback<T, F1, Fut1, F2, Fut2>(
        &self,
        primary: (&str, F1),
        fallback: (&str, F2),
        deadline: Option<Instant>,
    ) -> Result<T, DispatchError>
    where
        F1: FnMut() -> Fut1,
        Fut1: Future<Output = Result<T, RawFailure>>,
        F2: FnMut() -> Fut2,
        Fut2: Future<Output = Result<T, RawFailure>>,
    {
        let (primary_id, primary_op) = primary;
        let (fallback_id, fallback_op) = fallback;

        let primary_error = match self.execute(primary_id, deadline, primary_op).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        warn!(
            primary = primary_id,
            fallback = fallback_id,
            error = %primary_error,
            "Primary exhausted, switching to fallback"
        );

        match self.execute(fallback_id, deadline, fallback_op).await {
            Ok(value) => Ok(value),
            Err(fallback_error) => Err(DispatchError::FallbackExhausted {
                primary: Box::new(primary_error),
                fallback: Box::new(fallback_error),
            }),
        }
    }

    /// `None` when the caller's deadline elapsed before the attempt finished.
    async fn run_attempt<T, F, Fut>(
        &self,
        operation: &mut F,
        deadline: Option<Instant>,
    ) -> Option<Result<T, RawFailure>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        let attempt_deadline = self.attempt_timeout.map(|timeout| Instant::now() + timeout);
        let effective = match (attempt_deadline, deadline) {
            (Some(a), Some(d)) => Some(a.min(d)),
            (a, d) => a.or(d),
        };

        let Some(effective) = effective else {
            return Some(operation().await);
        };

        match tokio::time::timeout_at(effective, operation()).await {
            Ok(outcome) => Some(outcome),
            Err(_) if deadline.is_some_and(|d| effective >= d) => None,
            Err(_) => Some(Err(RawFailure::Timeout(format!(
                "attempt exceeded {:?}",
                self.attempt_timeout.unwrap_or_default()
            )))),
        }
    }

    fn surface(&self, record: ErrorRecord) -> ErrorRecord {
        self.metrics.record_surfaced(&record);
        record
    }
}
