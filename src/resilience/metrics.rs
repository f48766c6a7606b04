use crate::circuit::CircuitSnapshot;
use crate::error::{ErrorKind, ErrorRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct BackendStats {
    total_calls: u64,
    successes: u64,
    failures: u64,
    retries: u64,
    circuit_rejections: u64,
    consecutive_failures: u32,
    errors_by_kind: BTreeMap<ErrorKind, u64>,
    last_error: Option<ErrorRecord>,
    last_success_at: Option<DateTime<Utc>>,
    latency_total: Duration,
    quota_exhausted: bool,
    rate_limit_exhausted_at: Option<Instant>,
}

/// Point-in-time view of one backend's call history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub backend_id: String,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub consecutive_failures: u32,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub last_error: Option<ErrorRecord>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub average_latency_ms: f64,
    /// Set when a quota/billing failure surfaced; cleared explicitly.
    pub quota_exhausted: bool,
    /// Rate-limit retries were exhausted within the cool-down window.
    pub rate_limit_exhausted: bool,
    /// Filled in by the engine, which owns the breakers.
    pub circuit: Option<CircuitSnapshot>,
}

impl BackendMetrics {
    pub fn success_rate(&self) -> Option<f64> {
        let settled = self.successes + self.failures;
        (settled > 0).then(|| self.successes as f64 / settled as f64)
    }
}

/// Per-backend counters kept by the executor.
#[derive(Debug)]
pub struct MetricsRegistry {
    stats: DashMap<String, BackendStats>,
    rate_limit_cooldown: Duration,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MetricsRegistry {
    pub fn new(rate_limit_cooldown: Duration) -> Self {
        Self {
            stats: DashMap::new(),
            rate_limit_cooldown,
        }
    }

    pub fn record_success(&self, backend_id: &str, latency: Duration) {
        let mut stats = self.stats.entry(backend_id.to_string()).or_default();
        stats.total_calls += 1;
        stats.successes += 1;
        stats.consecutive_failures = 0;
        stats.latency_total += latency;
        stats.last_success_at = Some(Utc::now());
        stats.rate_limit_exhausted_at = None;
    }

    pub fn record_failure(&self, backend_id: &str, error: &ErrorRecord) {
        let mut stats = self.stats.entry(backend_id.to_string()).or_default();
        stats.total_calls += 1;
        stats.failures += 1;
        stats.consecutive_failures += 1;
        *stats.errors_by_kind.entry(error.kind()).or_insert(0) += 1;
        stats.last_error = Some(error.clone());
    }

    pub fn record_retry(&self, backend_id: &str) {
        self.stats.entry(backend_id.to_string()).or_default().retries += 1;
    }

    pub fn record_rejection(&self, backend_id: &str) {
        let mut stats = self.stats.entry(backend_id.to_string()).or_default();
        stats.circuit_rejections += 1;
        *stats.errors_by_kind.entry(ErrorKind::CircuitOpen).or_insert(0) += 1;
    }

    /// Note a failure that was handed back to the caller.
    pub fn record_surfaced(&self, error: &ErrorRecord) {
        let mut stats = self.stats.entry(error.backend_id().to_string()).or_default();
        match error.kind() {
            ErrorKind::QuotaExceeded => stats.quota_exhausted = true,
            ErrorKind::RateLimit => stats.rate_limit_exhausted_at = Some(Instant::now()),
            // Deadline cut off a rate-limit wait.
            _ if stats.consecutive_failures > 0
                && stats
                    .last_error
                    .as_ref()
                    .is_some_and(|last| last.kind() == ErrorKind::RateLimit) =>
            {
                stats.rate_limit_exhausted_at = Some(Instant::now())
            }
            _ => {}
        }
    }

    pub fn clear_quota_flag(&self, backend_id: &str) {
        if let Some(mut stats) = self.stats.get_mut(backend_id) {
            stats.quota_exhausted = false;
        }
    }

    /// Whether selection should rank this backend behind healthy ones.
    pub fn is_deprioritized(&self, backend_id: &str) -> bool {
        self.stats
            .get(backend_id)
            .map(|stats| stats.quota_exhausted || self.rate_limited(&stats))
            .unwrap_or(false)
    }

    pub fn snapshot(&self, backend_id: &str) -> BackendMetrics {
        match self.stats.get(backend_id) {
            Some(stats) => BackendMetrics {
                backend_id: backend_id.to_string(),
                total_calls: stats.total_calls,
                successes: stats.successes,
                failures: stats.failures,
                retries: stats.retries,
                circuit_rejections: stats.circuit_rejections,
                consecutive_failures: stats.consecutive_failures,
                errors_by_kind: stats.errors_by_kind.clone(),
                last_error: stats.last_error.clone(),
                last_success_at: stats.last_success_at,
                average_latency_ms: if stats.successes > 0 {
                    stats.latency_total.as_secs_f64() * 1000.0 / stats.successes as f64
                } else {
                    0.0
                },
                quota_exhausted: stats.quota_exhausted,
                rate_limit_exhausted: self.rate_limited(&stats),
                circuit: None,
            },
            None => BackendMetrics {
                backend_id: backend_id.to_string(),
                total_calls: 0,
                successes: 0,
                failures: 0,
                retries: 0,
                circuit_rejections: 0,
                consecutive_failures: 0,
                errors_by_kind: BTreeMap::new(),
                last_error: None,
                last_success_at: None,
                average_latency_ms: 0.0,
                quota_exhausted: false,
                rate_limit_exhausted: false,
                circuit: None,
            },
        }
    }

    fn rate_limited(&self, stats: &BackendStats) -> bool {
        stats
            .rate_limit_exhausted_at
            .is_some_and(|at| at.elapsed() < self.rate_limit_cooldown)
    }
}
