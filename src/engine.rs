//! # Resilience Engine
//!
//! Explicitly constructed owner of every per-backend store: adapters,
//! circuit breakers, metrics and capability snapshots. Callers hold an
//! `Arc<ResilienceEngine>` and route every backend interaction through it.
//!
//! ```text
//! ┌──────────────────────── ResilienceEngine ────────────────────────┐
//! │ BackendRegistry   CircuitRegistry   MetricsRegistry   Cache      │
//! │        │                 │                 │            ▲        │
//! │        ▼                 ▼                 ▼            │        │
//! │   ResilientExecutor ◄── ProviderSelector   CapabilityProber      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use provider_relay::{BackendRequest, EngineConfig, MockBackend, ResilienceEngine, SelectionCriteria};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(ResilienceEngine::new(EngineConfig::default())?);
//!     engine.register_backend(Arc::new(MockBackend::fully_capable("local")));
//!     engine.refresh_capabilities("local").await?;
//!
//!     let response = engine
//!         .dispatch(&SelectionCriteria::new(), &BackendRequest::new("Hello"), None)
//!         .await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

use crate::backend::{
    BackendAdapter, BackendRegistry, BackendRequest, BackendResponse, ResponseStream,
};
use crate::capability::{
    CapabilityCache, CapabilityComparison, CapabilityProber, ProviderCapabilities, compare,
};
use crate::circuit::{CircuitRegistry, CircuitState};
use crate::config::EngineConfig;
use crate::error::{DispatchError, ErrorKind, ErrorRecord, RawFailure};
use crate::resilience::{BackendMetrics, MetricsRegistry, ResilientExecutor};
use crate::retry::RetryRegistry;
use crate::selection::{BackendHealth, ProviderSelector, Selection, SelectionCriteria};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub struct ResilienceEngine {
    config: EngineConfig,
    backends: BackendRegistry,
    circuits: Arc<CircuitRegistry>,
    metrics: Arc<MetricsRegistry>,
    cache: Arc<CapabilityCache>,
    executor: Arc<ResilientExecutor>,
    prober: CapabilityProber,
    selector: ProviderSelector,
}

impl std::fmt::Debug for ResilienceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field("backends", &self.backends.backend_ids())
            .field("cached_snapshots", &self.cache.len())
            .finish()
    }
}

impl ResilienceEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let circuits = config.circuit_overrides.iter().fold(
            CircuitRegistry::new(config.circuit_breaker.clone()),
            |registry, (backend_id, breaker)| registry.with_override(backend_id.clone(), breaker.clone()),
        );
        let circuits = Arc::new(circuits);
        let metrics = Arc::new(MetricsRegistry::new(config.rate_limit_cooldown));
        let executor = Arc::new(
            ResilientExecutor::new(
                Arc::clone(&circuits),
                Arc::new(RetryRegistry::new(config.retry.clone())),
                Arc::clone(&metrics),
            )
                .with_attempt_timeout(config.attempt_timeout),
        );
        let prober = CapabilityProber::new(Arc::clone(&executor), config.probe.clone());

        info!(
            strategy = ?config.retry.strategy,
            failure_threshold = config.circuit_breaker.failure_threshold,
            cache_ttl = ?config.cache.ttl,
            "Resilience engine initialized"
        );

        Ok(Self {
            backends: BackendRegistry::new(),
            cache: Arc::new(CapabilityCache::new(config.cache.clone())),
            selector: ProviderSelector::new(config.selection.clone()),
            circuits,
            metrics,
            executor,
            prober,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add or replace an adapter. A replaced adapter's snapshot is dropped.
    pub fn register_backend(&self, adapter: Arc<dyn BackendAdapter>) -> Option<Arc<dyn BackendAdapter>> {
        let backend_id = adapter.backend_id().to_string();
        let previous = self.backends.register(adapter);
        if previous.is_some() {
            self.cache.invalidate(&backend_id);
        }
        previous
    }

    pub fn unregister_backend(&self, backend_id: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.cache.invalidate(backend_id);
        self.backends.unregister(backend_id)
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.backend_ids()
    }

    /// Rank registered backends with a fresh snapshot against `criteria`.
    pub fn select(&self, criteria: &SelectionCriteria) -> Result<Selection, DispatchError> {
        let snapshots: Vec<Arc<ProviderCapabilities>> = self
            .cache
            .snapshots()
            .into_iter()
            .filter(|snapshot| self.backends.get(&snapshot.backend_id).is_some())
            .collect();
        self.selector.select(criteria, &snapshots, &self.health())
    }

    /// Run `operation` against one backend/model through the breaker and
    /// retry policy. The operation is re-invoked for every attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        backend_id: &str,
        model_id: &str,
        mut operation: F,
        deadline: Option<Instant>,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(Arc<dyn BackendAdapter>, String) -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        let adapter = self
            .backends
            .get(backend_id)
            .ok_or_else(|| DispatchError::UnknownBackend(backend_id.to_string()))?;

        let result = self
            .executor
            .execute(backend_id, deadline, || operation(Arc::clone(&adapter), model_id.to_string()))
            .await;
        result.map_err(|error| {
            self.after_failure(&error);
            DispatchError::Backend(error)
        })
    }

    /// Single request through the resilient path.
    pub async fn invoke(
        &self,
        backend_id: &str,
        model_id: &str,
        request: &BackendRequest,
        deadline: Option<Instant>,
    ) -> Result<BackendResponse, DispatchError> {
        self.execute(
            backend_id,
            model_id,
            |adapter, model_id| {
                let request = request.clone();
                async move { adapter.invoke(&model_id, request).await }
            },
            deadline,
        )
        .await
    }

    /// Open a fragment stream. Establishing the stream is protected; once it
    /// is handed out, dropping it cancels the underlying call.
    pub async fn stream(
        &self,
        backend_id: &str,
        model_id: &str,
        request: &BackendRequest,
        deadline: Option<Instant>,
    ) -> Result<ResponseStream, DispatchError> {
        self.execute(
            backend_id,
            model_id,
            |adapter, model_id| {
                let request = request.clone();
                async move { adapter.stream(&model_id, request).await }
            },
            deadline,
        )
        .await
    }

    /// Try `primary` to exhaustion, then `fallback`; both are `(backend, model)`.
    pub async fn execute_with_fallback(
        &self,
        primary: (&str, &str),
        fallback: (&str, &str),
        request: &BackendRequest,
        deadline: Option<Instant>,
    ) -> Result<BackendResponse, DispatchError> {
        let primary_adapter = self
            .backends
            .get(primary.0)
            .ok_or_else(|| DispatchError::UnknownBackend(primary.0.to_string()))?;
        let fallback_adapter = self
            .backends
            .get(fallback.0)
            .ok_or_else(|| DispatchError::UnknownBackend(fallback.0.to_string()))?;

        let primary_op = || {
            let adapter = Arc::clone(&primary_adapter);
            let request = request.clone();
            let model_id = primary.1.to_string();
            async move { adapter.invoke(&model_id, request).await }
        };
        let fallback_op = || {
            let adapter = Arc::clone(&fallback_adapter);
            let request = request.clone();
            let model_id = fallback.1.to_string();
            async move { adapter.invoke(&model_id, request).await }
        };

        let result = self
            .executor
            .execute_with_fallback((primary.0, primary_op), (fallback.0, fallback_op), deadline)
            .await;
        if let Err(error) = &result {
            for record in error.records() {
                self.after_failure(record);
            }
        }
        result
    }

    /// Select, then walk the ranked candidates until one answers.
    ///
    /// Circuit-open and exhausted candidates fall through to the next one.
    /// Validation failures surface immediately since every backend would
    /// reject the same request.
    pub async fn dispatch(
        &self,
        criteria: &SelectionCriteria,
        request: &BackendRequest,
        deadline: Option<Instant>,
    ) -> Result<BackendResponse, DispatchError> {
        let selection = self.select(criteria)?;
        let mut attempts: Vec<ErrorRecord> = Vec::new();

        for candidate in selection.candidates() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("Dispatch deadline reached before trying {}", candidate.backend_id);
                break;
            }
            let outcome = self
                .invoke(&candidate.backend_id, &candidate.model_id, request, deadline)
                .await;
            let record = match outcome {
                Ok(response) => {
                    if !attempts.is_empty() {
                        info!(
                            backend = %candidate.backend_id,
                            failed_before = attempts.len(),
                            "Dispatch succeeded on fallback candidate"
                        );
                    }
                    return Ok(response);
                }
                Err(DispatchError::Backend(record)) => record,
                Err(DispatchError::UnknownBackend(id)) => {
                    debug!(backend = %id, "Candidate unregistered during dispatch");
                    continue;
                }
                Err(other) => return Err(other),
            };

            match record.kind() {
                ErrorKind::Validation => {
                    warn!(backend = %candidate.backend_id, error = %record, "Request rejected as invalid");
                    return Err(DispatchError::Backend(record));
                }
                ErrorKind::Authentication => {
                    warn!(
                        backend = %candidate.backend_id,
                        error = %record,
                        "Authentication failed, failing over to next candidate"
                    );
                }
                ErrorKind::CircuitOpen => {
                    debug!(backend = %candidate.backend_id, "Circuit open, trying next candidate");
                }
                kind => {
                    info!(backend = %candidate.backend_id, %kind, "Candidate failed, trying next");
                }
            }
            let deadline_hit = record.context().contains_key("deadline_exceeded");
            attempts.push(record);
            if deadline_hit {
                break;
            }
        }

        if attempts.is_empty() {
            return Err(DispatchError::NoEligibleBackend {
                reason: "no selected candidate could be attempted".to_string(),
            });
        }
        Err(DispatchError::AllCandidatesFailed { attempts })
    }

    /// Cached snapshot, if present and fresh.
    pub fn get_capabilities(&self, backend_id: &str) -> Option<Arc<ProviderCapabilities>> {
        self.cache.get(backend_id)
    }

    /// Probe now, bypassing the TTL, and replace the cached snapshot.
    pub async fn refresh_capabilities(&self, backend_id: &str) -> Result<Arc<ProviderCapabilities>, DispatchError> {
        let adapter = self
            .backends
            .get(backend_id)
            .ok_or_else(|| DispatchError::UnknownBackend(backend_id.to_string()))?;
        let previous = self.cache.get(backend_id);

        let fresh = self.prober.probe(adapter).await?;
        if let Some(previous) = previous {
            self.report_drift(&previous, &fresh);
        }
        Ok(self.cache.set(fresh))
    }

    /// Probe every registered backend, one after another.
    pub async fn refresh_all(&self) -> HashMap<String, Result<Arc<ProviderCapabilities>, DispatchError>> {
        let mut results = HashMap::new();
        for backend_id in self.backends.backend_ids() {
            let result = self.refresh_capabilities(&backend_id).await;
            if let Err(error) = &result {
                warn!(backend = %backend_id, error = %error, "Capability refresh failed");
            }
            results.insert(backend_id, result);
        }
        results
    }

    /// Similarity of two cached snapshots, if both are present.
    pub fn compare_backends(&self, a: &str, b: &str) -> Option<CapabilityComparison> {
        let (a, b) = (self.cache.get(a)?, self.cache.get(b)?);
        Some(compare(&a, &b, &self.config.comparison))
    }

    pub fn get_circuit_state(&self, backend_id: &str) -> CircuitState {
        self.circuits.state(backend_id)
    }

    pub fn get_metrics(&self, backend_id: &str) -> BackendMetrics {
        let mut metrics = self.metrics.snapshot(backend_id);
        metrics.circuit = self.circuits.snapshot(backend_id);
        metrics
    }

    /// Force the breaker back to Closed.
    pub fn reset_circuit(&self, backend_id: &str) {
        info!(backend = backend_id, "Circuit manually reset");
        self.circuits.reset(backend_id);
        self.executor.retries().reset(backend_id);
    }

    /// Lift quota deprioritization once billing is resolved externally.
    pub fn clear_quota_flag(&self, backend_id: &str) {
        self.metrics.clear_quota_flag(backend_id);
    }

    /// Start one staggered refresh timer per currently registered backend.
    ///
    /// Backends registered afterwards are picked up by the next call.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> RefreshHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = self.config.probe.refresh_interval;
        let backend_ids = self.backends.backend_ids();
        let stagger = period / (backend_ids.len().max(1) as u32);

        let tasks = backend_ids
            .iter()
            .enumerate()
            .map(|(index, backend_id)| {
                let engine = Arc::clone(self);
                let backend_id = backend_id.clone();
                let shutdown = shutdown_rx.clone();
                let offset = stagger * index as u32;
                tokio::spawn(refresh_task(engine, backend_id, period, offset, shutdown))
            })
            .collect();

        info!(
            backends = backend_ids.len(),
            interval = ?period,
            "Capability refresh loop started"
        );
        RefreshHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }

    fn health(&self) -> HashMap<String, BackendHealth> {
        self.backends
            .backend_ids()
            .into_iter()
            .map(|backend_id| {
                let health = BackendHealth {
                    circuit: self.circuits.state(&backend_id),
                    deprioritized: self.metrics.is_deprioritized(&backend_id),
                };
                (backend_id, health)
            })
            .collect()
    }

    /// Drop snapshots that a surfaced failure proved stale.
    fn after_failure(&self, error: &ErrorRecord) {
        match error.kind() {
            ErrorKind::Authentication | ErrorKind::ModelNotFound => {
                if self.cache.invalidate(error.backend_id()) {
                    info!(
                        backend = error.backend_id(),
                        kind = %error.kind(),
                        "Capability snapshot invalidated after hard failure"
                    );
                }
            }
            _ => {}
        }
    }

    fn report_drift(&self, previous: &ProviderCapabilities, fresh: &ProviderCapabilities) {
        let comparison = compare(previous, fresh, &self.config.comparison);
        if comparison.score < self.config.probe.drift_threshold {
            let high: Vec<&str> = comparison.high_impact().map(|d| d.path.as_str()).collect();
            warn!(
                backend = %fresh.backend_id,
                score = comparison.score,
                high_impact = ?high,
                "Capability drift detected: {}",
                comparison.recommendation
            );
        } else if !comparison.differences.is_empty() {
            debug!(
                backend = %fresh.backend_id,
                differences = comparison.differences.len(),
                "Minor capability changes since last probe"
            );
        }
    }
}

async fn refresh_task(
    engine: Arc<ResilienceEngine>,
    backend_id: String,
    period: Duration,
    offset: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(offset) => {}
        _ = shutdown.changed() => return,
    }

    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = shutdown.changed() => break,
        }
        tokio::select! {
            result = engine.refresh_capabilities(&backend_id) => match result {
                Ok(snapshot) => debug!(
                    backend = %backend_id,
                    confidence = snapshot.confidence,
                    "Scheduled capability refresh completed"
                ),
                Err(error) => warn!(backend = %backend_id, error = %error, "Scheduled capability refresh failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(backend = %backend_id, "Refresh task stopped");
}

/// Stops the background refresh tasks.
#[derive(Debug)]
pub struct RefreshHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RefreshHandle {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Refresh task ended abnormally: {}", e);
            }
        }
        info!("Capability refresh loop stopped");
    }
}
