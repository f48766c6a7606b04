//! Active capability discovery.
//!
//! Every backend call made here goes through the [`ResilientExecutor`], so a
//! probe is subject to the same breaker, retry and timeout rules as live
//! traffic and can never hang a refresh cycle.

use crate::backend::{
    BackendAdapter, BackendRequest, ModelDescriptor, ProbeKind, ProbeOutcome, ResponseFormat,
    ToolSpec,
};
use crate::capability::types::{
    Feature, LatencyPercentiles, ModelCapabilities, PerformanceMetrics, ProbeReport,
    ProviderCapabilities,
};
use crate::env::probe::{TOKEN_PREFIX, TOOL_NAME};
use crate::error::{DispatchError, ErrorKind, ErrorRecord, RawFailure};
use crate::resilience::ResilientExecutor;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How the confidence score blends battery completion and model coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub completion: f64,
    pub models: f64,
    /// Enumerated model count at which the coverage term saturates.
    pub model_saturation: usize,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            completion: 0.7,
            models: 0.3,
            model_saturation: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Deadline for each individual sub-test, retries included.
    pub subtest_timeout: Duration,
    pub latency_samples: usize,
    /// Models beyond this many keep only their declared attributes.
    pub max_models: usize,
    pub refresh_interval: Duration,
    /// Comparison score under which a refresh is reported as drift.
    pub drift_threshold: f64,
    pub confidence: ConfidenceWeights,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            subtest_timeout: Duration::from_secs(10),
            latency_samples: 5,
            max_models: 8,
            refresh_interval: Duration::from_secs(15 * 60),
            drift_threshold: 0.9,
            confidence: ConfidenceWeights::default(),
        }
    }
}

/// Result of one sub-test. `None` means it produced no information.
type SubtestResult = Option<bool>;

#[derive(Debug, Default)]
struct LatencySample {
    latencies_ms: Vec<f64>,
    output_tokens: u64,
    busy: Duration,
    attempted: usize,
}

/// Runs the functional battery against a backend and builds its snapshot.
#[derive(Debug, Clone)]
pub struct CapabilityProber {
    executor: Arc<ResilientExecutor>,
    config: ProbeConfig,
}

impl CapabilityProber {
    pub fn new(executor: Arc<ResilientExecutor>, config: ProbeConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Discover what `adapter` can actually do.
    ///
    /// Fails only when the model list itself cannot be obtained. Individual
    /// sub-test failures lower the confidence of the snapshot instead.
    pub async fn probe(
        &self,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<ProviderCapabilities, DispatchError> {
        let adapter: &dyn BackendAdapter = adapter.as_ref();
        let backend_id = adapter.backend_id().to_string();
        info!(backend = %backend_id, "Probing backend capabilities");

        let descriptors = self
            .executor
            .execute(&backend_id, Some(self.subtest_deadline()), move || adapter.list_models())
            .await
            .map_err(|error| DispatchError::ProbeFailed {
                backend_id: backend_id.clone(),
                reason: error.to_string(),
            })?;

        let mut report = ProbeReport {
            models_enumerated: descriptors.len(),
            ..Default::default()
        };
        let mut models = Vec::with_capacity(descriptors.len());

        for (index, descriptor) in descriptors.into_iter().enumerate() {
            if index >= self.config.max_models {
                debug!(backend = %backend_id, model = %descriptor.model_id, "Model beyond probe limit, using declared attributes");
                models.push(unprobed(descriptor));
                continue;
            }
            models.push(self.probe_model(adapter, descriptor, &mut report).await);
            report.models_probed += 1;
        }

        let confidence = self.confidence(&report);
        let profile = adapter.profile();
        info!(
            backend = %backend_id,
            models = models.len(),
            completed = report.subtests_completed,
            run = report.subtests_run,
            confidence,
            "Capability probe finished"
        );

        Ok(ProviderCapabilities {
            backend_id,
            models,
            limits: profile.limits,
            certifications: profile.certifications,
            advertised_uptime: profile.advertised_uptime,
            confidence,
            probed_at: Utc::now(),
            report,
        })
    }

    async fn probe_model(
        &self,
        adapter: &dyn BackendAdapter,
        descriptor: ModelDescriptor,
        report: &mut ProbeReport,
    ) -> ModelCapabilities {
        let model_id = descriptor.model_id.as_str();
        let mut features = declared_unprobeable(&descriptor.declared_features);
        let mut results = BTreeMap::new();
        let mut performance = PerformanceMetrics::default();

        for kind in ProbeKind::BATTERY {
            report.subtests_run += 1;
            let outcome = if kind == ProbeKind::Latency {
                let (outcome, measured) = self.measure_latency(adapter, model_id).await;
                performance = measured;
                outcome
            } else {
                self.run_subtest(adapter, model_id, kind).await
            };

            let Some(passed) = outcome else {
                continue;
            };
            report.subtests_completed += 1;
            results.insert(probe_name(kind).to_string(), passed);
            if passed && let Some(feature) = kind.feature() {
                features.insert(feature);
            }
        }

        report.results.insert(descriptor.model_id.clone(), results);
        ModelCapabilities {
            model_id: descriptor.model_id,
            model_type: descriptor.model_type,
            context_window: descriptor.context_window,
            max_output_tokens: descriptor.max_output_tokens,
            features,
            pricing: descriptor.pricing,
            performance,
        }
    }

    async fn run_subtest(
        &self,
        adapter: &dyn BackendAdapter,
        model_id: &str,
        kind: ProbeKind,
    ) -> SubtestResult {
        let backend_id = adapter.backend_id();
        let outcome = self
            .executor
            .execute(backend_id, Some(self.subtest_deadline()), move || {
                subtest(adapter, model_id, kind)
            })
            .await;

        match outcome {
            Ok(passed) => {
                debug!(backend = backend_id, model = model_id, test = probe_name(kind), passed, "Sub-test finished");
                Some(passed)
            }
            Err(error) => interpret_subtest_error(backend_id, model_id, kind, &error),
        }
    }

    async fn measure_latency(
        &self,
        adapter: &dyn BackendAdapter,
        model_id: &str,
    ) -> (SubtestResult, PerformanceMetrics) {
        let backend_id = adapter.backend_id();
        let mut sample = LatencySample::default();

        for _ in 0..self.config.latency_samples.max(1) {
            sample.attempted += 1;
            // Timed per attempt so retries and backoff never inflate a sample.
            let response = self
                .executor
                .execute(backend_id, Some(self.subtest_deadline()), move || async move {
                    let started = Instant::now();
                    let request = BackendRequest::new("Reply with the single word: pong").with_max_tokens(8);
                    let response = adapter.invoke(model_id, request).await?;
                    Ok::<_, RawFailure>((response, started.elapsed()))
                })
                .await;
            match response {
                Ok((response, elapsed)) => {
                    sample.latencies_ms.push(elapsed.as_secs_f64() * 1000.0);
                    sample.output_tokens += response.token_usage.output_tokens;
                    sample.busy += elapsed;
                }
                Err(error) => {
                    debug!(backend = backend_id, model = model_id, error = %error, "Latency sample failed");
                    if error.kind() == ErrorKind::CircuitOpen {
                        break;
                    }
                }
            }
        }

        if sample.latencies_ms.is_empty() {
            return (None, PerformanceMetrics::default());
        }
        let reliability = sample.latencies_ms.len() as f64 / sample.attempted as f64;
        let throughput = if sample.busy.is_zero() {
            0.0
        } else {
            sample.output_tokens as f64 / sample.busy.as_secs_f64()
        };
        let performance = PerformanceMetrics {
            latency: LatencyPercentiles::from_samples(&sample.latencies_ms),
            throughput_tokens_per_sec: throughput,
            reliability,
        };
        (Some(true), performance)
    }

    fn confidence(&self, report: &ProbeReport) -> f64 {
        let weights = &self.config.confidence;
        let completion = if report.subtests_run == 0 {
            0.0
        } else {
            report.subtests_completed as f64 / report.subtests_run as f64
        };
        let coverage = if weights.model_saturation == 0 {
            if report.models_enumerated > 0 { 1.0 } else { 0.0 }
        } else {
            (report.models_enumerated as f64 / weights.model_saturation as f64).min(1.0)
        };
        let total = weights.completion + weights.models;
        if total <= 0.0 {
            return completion.clamp(0.0, 1.0);
        }
        ((weights.completion * completion + weights.models * coverage) / total).clamp(0.0, 1.0)
    }

    fn subtest_deadline(&self) -> Instant {
        Instant::now() + self.config.subtest_timeout
    }
}

/// Single attempt of a functional test. `Ok(false)` means the backend
/// answered but did not exhibit the feature.
async fn subtest(
    adapter: &dyn BackendAdapter,
    model_id: &str,
    kind: ProbeKind,
) -> Result<bool, RawFailure> {
    if let Some(native) = adapter.probe(model_id, kind) {
        return native.await.map(|outcome| outcome == ProbeOutcome::Supported);
    }

    match kind {
        ProbeKind::Streaming => {
            let request = BackendRequest::new("Count from one to five, separated by spaces.");
            let mut stream = adapter.stream(model_id, request).await?;
            let mut non_empty = 0usize;
            while let Some(fragment) = stream.next().await {
                if !fragment?.delta.trim().is_empty() {
                    non_empty += 1;
                }
            }
            Ok(non_empty >= 2)
        }
        ProbeKind::StructuredOutput => {
            let request = BackendRequest::new(
                "Return a JSON object with a single key \"status\" whose value is \"ok\".",
            )
            .with_response_format(ResponseFormat::Json);
            let response = adapter.invoke(model_id, request).await?;
            let parsed = serde_json::from_str::<serde_json::Value>(response.content.trim());
            Ok(matches!(parsed, Ok(value) if value.is_object() || value.is_array()))
        }
        ProbeKind::SystemMessage => {
            let token = format!("{}{}", TOKEN_PREFIX, &Uuid::new_v4().simple().to_string()[..8]);
            let request = BackendRequest::new("What is the token?").with_system_message(format!(
                "Reply with exactly this token and nothing else: {}",
                token
            ));
            let response = adapter.invoke(model_id, request).await?;
            Ok(response.content.contains(&token))
        }
        ProbeKind::ToolCalling => {
            let request = BackendRequest::new(format!("Call {} with status \"ok\".", TOOL_NAME))
                .with_tool(ToolSpec {
                    name: TOOL_NAME.to_string(),
                    description: "Report the probe status".to_string(),
                    parameters: serde_json::json!({
                        "type": "object",
                        "properties": { "status": { "type": "string" } },
                        "required": ["status"]
                    }),
                });
            let response = adapter.invoke(model_id, request).await?;
            Ok(response.tool_calls.iter().any(|call| call.name == TOOL_NAME))
        }
        ProbeKind::Latency => Ok(true),
    }
}

/// A request rejected as invalid is an explicit "unsupported"; any other
/// failure leaves the feature unknown.
fn interpret_subtest_error(
    backend_id: &str,
    model_id: &str,
    kind: ProbeKind,
    error: &ErrorRecord,
) -> SubtestResult {
    if error.kind() == ErrorKind::Validation {
        debug!(backend = backend_id, model = model_id, test = probe_name(kind), "Feature rejected by backend");
        return Some(false);
    }
    warn!(
        backend = backend_id,
        model = model_id,
        test = probe_name(kind),
        error = %error,
        "Sub-test produced no result"
    );
    None
}

fn probe_name(kind: ProbeKind) -> &'static str {
    match kind {
        ProbeKind::Streaming => "streaming",
        ProbeKind::StructuredOutput => "structured_output",
        ProbeKind::SystemMessage => "system_message",
        ProbeKind::ToolCalling => "tool_calling",
        ProbeKind::Latency => "latency",
    }
}

/// Declared features the battery cannot verify (multimodal, for one).
fn declared_unprobeable(declared: &BTreeSet<Feature>) -> BTreeSet<Feature> {
    declared
        .iter()
        .copied()
        .filter(|feature| !ProbeKind::BATTERY.iter().any(|kind| kind.feature() == Some(*feature)))
        .collect()
}

fn unprobed(descriptor: ModelDescriptor) -> ModelCapabilities {
    ModelCapabilities {
        features: declared_unprobeable(&descriptor.declared_features),
        model_id: descriptor.model_id,
        model_type: descriptor.model_type,
        context_window: descriptor.context_window,
        max_output_tokens: descriptor.max_output_tokens,
        pricing: descriptor.pricing,
        performance: PerformanceMetrics::default(),
    }
}
