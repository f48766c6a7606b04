use super::*;
use crate::backend::{
    BackendAdapter, BackendProfile, BackendRequest, BackendResponse, MockBackend, ModelDescriptor,
    ResponseStream,
};
use crate::circuit::{CircuitBreakerConfig, CircuitRegistry};
use crate::error::{DispatchError, RawFailure};
use crate::resilience::{MetricsRegistry, ResilientExecutor};
use crate::retry::{FixedDelay, RetryRegistry};
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn executor() -> Arc<ResilientExecutor> {
    executor_retrying(FixedDelay::new(Duration::from_millis(10), 1))
}

fn executor_retrying(strategy: FixedDelay) -> Arc<ResilientExecutor> {
    let circuits = CircuitRegistry::new(CircuitBreakerConfig {
        failure_threshold: 100,
        ..Default::default()
    });
    let executor = ResilientExecutor::new(
        Arc::new(circuits),
        Arc::new(RetryRegistry::shared(Arc::new(strategy))),
        Arc::new(MetricsRegistry::default()),
    );
    Arc::new(executor)
}

/// Fails the first latency ping once, then behaves like the wrapped mock.
struct FirstPingFails {
    inner: MockBackend,
    failed: AtomicBool,
}

impl BackendAdapter for FirstPingFails {
    fn backend_id(&self) -> &str {
        self.inner.backend_id()
    }

    fn invoke(
        &self,
        model_id: &str,
        request: BackendRequest,
    ) -> BoxFuture<'_, Result<BackendResponse, RawFailure>> {
        if request.prompt.contains("pong") && !self.failed.swap(true, Ordering::SeqCst) {
            return Box::pin(async { Err::<BackendResponse, _>(RawFailure::http(503, "service unavailable")) });
        }
        self.inner.invoke(model_id, request)
    }

    fn stream(
        &self,
        model_id: &str,
        request: BackendRequest,
    ) -> BoxFuture<'_, Result<ResponseStream, RawFailure>> {
        self.inner.stream(model_id, request)
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelDescriptor>, RawFailure>> {
        self.inner.list_models()
    }
}

fn prober() -> CapabilityProber {
    CapabilityProber::new(executor(), ProbeConfig::default())
}

fn model(model_id: &str, features: &[Feature]) -> ModelCapabilities {
    ModelCapabilities {
        model_id: model_id.to_string(),
        model_type: ModelType::Chat,
        context_window: 128_000,
        max_output_tokens: 4_096,
        features: features.iter().copied().collect(),
        pricing: Pricing::per_1k(0.001, 0.002),
        performance: PerformanceMetrics::default(),
    }
}

fn snapshot(backend_id: &str, models: Vec<ModelCapabilities>, certifications: &[&str]) -> ProviderCapabilities {
    ProviderCapabilities {
        backend_id: backend_id.to_string(),
        models,
        limits: BackendLimits::default(),
        certifications: certifications.iter().map(|c| c.to_string()).collect(),
        advertised_uptime: Some(0.999),
        confidence: 1.0,
        probed_at: chrono::Utc::now(),
        report: ProbeReport::default(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_probe_discovers_supported_features() {
    let backend = Arc::new(MockBackend::fully_capable("alpha").with_profile(
        BackendProfile::default()
            .with_certification("soc2")
            .with_advertised_uptime(0.995),
    ));

    let caps = prober().probe(backend).await.expect("probe succeeds");
    assert_eq!(caps.backend_id, "alpha");
    assert_eq!(caps.models.len(), 1);

    let model = &caps.models[0];
    for feature in [
        Feature::Streaming,
        Feature::StructuredOutput,
        Feature::SystemMessages,
        Feature::ToolCalling,
    ] {
        assert!(model.supports(feature), "missing {}", feature);
    }
    assert!(!model.supports(Feature::Multimodal));

    let latency = model.performance.latency;
    assert_eq!(latency.samples, 5);
    assert!(latency.p50_ms >= 10.0);
    assert_eq!(model.performance.reliability, 1.0);

    assert_eq!(caps.report.subtests_run, 5);
    assert_eq!(caps.report.subtests_completed, 5);
    assert!(caps.certifications.contains("soc2"));
    assert_eq!(caps.advertised_uptime, Some(0.995));
    // Full completion, one of three saturating models.
    assert!((caps.confidence - 0.8).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_probe_reports_observed_not_declared() {
    let descriptor = ModelDescriptor::chat("vision-1", Pricing::per_1k(0.01, 0.03))
        .with_declared_feature(Feature::Streaming)
        .with_declared_feature(Feature::Multimodal);
    let backend = Arc::new(MockBackend::new("beta").with_models(vec![descriptor]));

    let caps = prober().probe(backend).await.expect("probe succeeds");
    let model = caps.model("vision-1").expect("model listed");
    assert!(!model.supports(Feature::Streaming));
    assert!(model.supports(Feature::Multimodal));
    assert_eq!(model.features.len(), 1);

    let results = &caps.report.results["vision-1"];
    assert_eq!(results["streaming"], false);
    assert_eq!(results["latency"], true);
}

#[tokio::test(start_paused = true)]
async fn test_failing_subtests_lower_confidence() {
    let backend = Arc::new(MockBackend::fully_capable("gamma"));
    backend.set_persistent_failure(Some(RawFailure::http(500, "internal error")));

    let caps = prober().probe(backend).await.expect("model list still works");
    assert_eq!(caps.report.subtests_completed, 0);
    assert!(caps.models[0].features.is_empty());
    assert!(!caps.models[0].performance.latency.is_measured());
    assert!((caps.confidence - 0.1).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_latency_excludes_retry_backoff() {
    let backend = Arc::new(FirstPingFails {
        inner: MockBackend::fully_capable("zeta"),
        failed: AtomicBool::new(false),
    });
    let prober = CapabilityProber::new(
        executor_retrying(FixedDelay::new(Duration::from_millis(500), 3)),
        ProbeConfig::default(),
    );

    let caps = prober.probe(backend).await.expect("probe succeeds");
    let performance = caps.models[0].performance;
    assert_eq!(performance.latency.samples, 5);
    assert_eq!(performance.reliability, 1.0);
    assert!(performance.latency.p95_ms < 50.0, "p95 was {}", performance.latency.p95_ms);
    assert!(performance.latency.p99_ms < 50.0);
}

#[tokio::test(start_paused = true)]
async fn test_model_list_failure_fails_probe() {
    let backend = Arc::new(MockBackend::fully_capable("delta"));
    backend.set_list_models_failure(Some(RawFailure::Transport("connection refused".into())));

    let err = prober().probe(backend).await.unwrap_err();
    assert!(matches!(err, DispatchError::ProbeFailed { ref backend_id, .. } if backend_id == "delta"));
}

#[tokio::test(start_paused = true)]
async fn test_models_beyond_limit_are_not_probed() {
    let models = (0..3)
        .map(|i| ModelDescriptor::chat(format!("m{}", i), Pricing::default()))
        .collect();
    let backend = Arc::new(MockBackend::fully_capable("epsilon").with_models(models));
    let config = ProbeConfig {
        max_models: 1,
        ..Default::default()
    };
    let prober = CapabilityProber::new(executor(), config);

    let caps = prober.probe(backend.clone()).await.expect("probe succeeds");
    assert_eq!(caps.report.models_enumerated, 3);
    assert_eq!(caps.report.models_probed, 1);
    assert_eq!(caps.models.len(), 3);
    assert!(caps.models[0].supports(Feature::Streaming));
    assert!(caps.models[2].features.is_empty());
}

#[test]
fn test_comparison_of_identical_snapshots() {
    let a = snapshot("a", vec![model("m", &[Feature::Streaming])], &["soc2"]);
    let b = snapshot("b", vec![model("m", &[Feature::Streaming])], &["soc2"]);
    let comparison = compare(&a, &b, &ComparisonWeights::default());
    assert!((comparison.score - 1.0).abs() < 1e-12);
    assert!(comparison.differences.is_empty());
}

#[test]
fn test_certification_only_difference_is_low_impact() {
    let a = snapshot("a", vec![model("m", &[Feature::Streaming])], &["soc2", "hipaa"]);
    let b = snapshot("b", vec![model("m", &[Feature::Streaming])], &["soc2"]);
    let comparison = compare(&a, &b, &ComparisonWeights::default());

    assert!(comparison.score < 1.0);
    assert_eq!(comparison.differences.len(), 1);
    let difference = &comparison.differences[0];
    assert_eq!(difference.category, DifferenceCategory::Certifications);
    assert_eq!(difference.impact, Impact::Low);
    assert_eq!(difference.path, "certifications.hipaa");
}

#[test]
fn test_comparison_is_symmetric_and_bounded() {
    let snapshots = [
        snapshot("a", vec![model("m", &[Feature::Streaming, Feature::ToolCalling])], &["soc2"]),
        snapshot("b", vec![model("m", &[Feature::StructuredOutput])], &[]),
        snapshot("c", Vec::new(), &["iso27001", "soc2"]),
    ];
    let weights = ComparisonWeights::default();
    for a in &snapshots {
        for b in &snapshots {
            let ab = compare(a, b, &weights);
            let ba = compare(b, a, &weights);
            assert!((0.0..=1.0).contains(&ab.score));
            assert!((ab.score - ba.score).abs() < 1e-12);
            assert_eq!(ab.differences.len(), ba.differences.len());
        }
    }
}

#[test]
fn test_missing_streaming_is_high_impact() {
    let a = snapshot("a", vec![model("m", &[Feature::Streaming])], &[]);
    let b = snapshot("b", vec![model("m", &[])], &[]);
    let comparison = compare(&a, &b, &ComparisonWeights::default());
    let high: BTreeSet<_> = comparison.high_impact().map(|d| d.path.as_str()).collect();
    assert!(high.contains("features.streaming"));
}
