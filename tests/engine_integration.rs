use futures::StreamExt;
use provider_relay::backend::{BackendProfile, MockBackend, ModelDescriptor};
use provider_relay::{
    BackendRequest, CircuitBreakerConfig, CircuitState, DispatchError, EngineConfig, ErrorKind,
    Feature, Pricing, Priority, RawFailure, ResilienceEngine, RetryConfig, SelectionCriteria,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            cap_delay: Duration::from_millis(100),
            jitter: 0.0,
            adaptive: None,
            ..Default::default()
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        },
        attempt_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    }
}

fn priced(backend_id: &str, input: f64, output: f64) -> MockBackend {
    MockBackend::fully_capable(backend_id).with_models(vec![ModelDescriptor::chat(
        format!("{}-model", backend_id),
        Pricing::per_1k(input, output),
    )])
}

/// Two streaming backends, `cheap` ranked first under cost priority.
async fn engine_with_two_backends() -> (Arc<ResilienceEngine>, Arc<MockBackend>, Arc<MockBackend>) {
    let engine = Arc::new(ResilienceEngine::new(test_config()).unwrap());
    let cheap = Arc::new(priced("cheap", 0.001, 0.002));
    let pricey = Arc::new(priced("pricey", 0.002, 0.006));
    engine.register_backend(cheap.clone());
    engine.register_backend(pricey.clone());
    for (backend_id, result) in engine.refresh_all().await {
        assert!(result.is_ok(), "probe of {} failed", backend_id);
    }
    (engine, cheap, pricey)
}

fn cost_first() -> SelectionCriteria {
    SelectionCriteria::new()
        .require_feature(Feature::Streaming)
        .with_priority(Priority::Cost)
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_respects_ceiling_and_feature() {
    let engine = Arc::new(ResilienceEngine::new(test_config()).unwrap());
    engine.register_backend(Arc::new(priced("premium", 0.01, 0.03)));
    engine.register_backend(Arc::new(
        MockBackend::new("no-stream").with_models(vec![ModelDescriptor::chat("basic", Pricing::per_1k(0.0001, 0.0001))]),
    ));
    engine.register_backend(Arc::new(priced("fit", 0.002, 0.006)));
    engine.refresh_all().await;

    let criteria = SelectionCriteria::new()
        .require_feature(Feature::Streaming)
        .with_max_cost_per_1k(0.005);
    let selection = engine.select(&criteria).unwrap();
    assert_eq!(selection.primary.backend_id, "fit");
    assert!(selection.alternatives.is_empty());

    let response = engine
        .dispatch(&criteria, &BackendRequest::new("hello"), None)
        .await
        .unwrap();
    assert_eq!(response.model_used, "fit-model");
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_fails_over_to_alternative() {
    let (engine, cheap, pricey) = engine_with_two_backends().await;
    cheap.set_persistent_failure(Some(RawFailure::http(503, "service unavailable")));
    let pricey_calls = pricey.calls();

    let response = engine
        .dispatch(&cost_first(), &BackendRequest::new("hello"), None)
        .await
        .unwrap();
    assert_eq!(response.model_used, "pricey-model");
    assert_eq!(pricey.calls(), pricey_calls + 1);

    let metrics = engine.get_metrics("cheap");
    assert!(metrics.failures >= 2);
    assert_eq!(metrics.last_error.unwrap().kind(), ErrorKind::ServerError);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skips_backend_without_calling_it() {
    let (engine, cheap, _pricey) = engine_with_two_backends().await;
    cheap.set_persistent_failure(Some(RawFailure::Transport("connection reset".into())));

    // Two attempts per dispatch, threshold three: the second dispatch opens it.
    for _ in 0..2 {
        engine
            .dispatch(&cost_first(), &BackendRequest::new("hello"), None)
            .await
            .unwrap();
    }
    assert_eq!(engine.get_circuit_state("cheap"), CircuitState::Open);

    let calls_when_opened = cheap.calls();
    let selection = engine.select(&cost_first()).unwrap();
    assert_eq!(selection.primary.backend_id, "pricey");
    assert!(selection.alternatives[0].circuit_open);

    engine
        .dispatch(&cost_first(), &BackendRequest::new("hello"), None)
        .await
        .unwrap();
    assert_eq!(cheap.calls(), calls_when_opened);

    let metrics = engine.get_metrics("cheap");
    assert_eq!(metrics.circuit.unwrap().state, CircuitState::Open);

    engine.reset_circuit("cheap");
    assert_eq!(engine.get_circuit_state("cheap"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_validation_error_is_not_failed_over() {
    let (engine, cheap, pricey) = engine_with_two_backends().await;
    cheap.set_persistent_failure(Some(RawFailure::http(400, "invalid request: unknown field")));
    let pricey_calls = pricey.calls();

    let err = engine
        .dispatch(&cost_first(), &BackendRequest::new("hello"), None)
        .await
        .unwrap_err();
    match err {
        DispatchError::Backend(record) => {
            assert_eq!(record.kind(), ErrorKind::Validation);
            assert_eq!(record.backend_id(), "cheap");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(pricey.calls(), pricey_calls);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_invalidates_and_fails_over() {
    let (engine, cheap, _pricey) = engine_with_two_backends().await;
    cheap.set_persistent_failure(Some(RawFailure::http(401, "invalid api key")));

    let response = engine
        .dispatch(&cost_first(), &BackendRequest::new("hello"), None)
        .await
        .unwrap();
    assert_eq!(response.model_used, "pricey-model");
    assert!(engine.get_capabilities("cheap").is_none());
    assert!(engine.get_capabilities("pricey").is_some());
    assert_eq!(engine.get_circuit_state("cheap"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_all_candidates_failed_carries_every_record() {
    let (engine, cheap, pricey) = engine_with_two_backends().await;
    cheap.set_persistent_failure(Some(RawFailure::http(500, "internal server error")));
    pricey.set_persistent_failure(Some(RawFailure::http(502, "bad gateway")));

    let err = engine
        .dispatch(&cost_first(), &BackendRequest::new("hello"), None)
        .await
        .unwrap_err();
    let records = err.records();
    assert!(matches!(err, DispatchError::AllCandidatesFailed { .. }));
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].backend_id(), "cheap");
    assert_eq!(records[1].backend_id(), "pricey");
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhaustion_deprioritizes_until_cleared() {
    let (engine, cheap, _pricey) = engine_with_two_backends().await;
    cheap.fail_next([RawFailure::http(402, "payment required")]);

    engine
        .dispatch(&cost_first(), &BackendRequest::new("hello"), None)
        .await
        .unwrap();
    assert!(engine.get_metrics("cheap").quota_exhausted);
    assert_eq!(engine.select(&cost_first()).unwrap().primary.backend_id, "pricey");

    engine.clear_quota_flag("cheap");
    assert_eq!(engine.select(&cost_first()).unwrap().primary.backend_id, "cheap");
}

#[tokio::test(start_paused = true)]
async fn test_execute_with_fallback_through_engine() {
    let (engine, cheap, _pricey) = engine_with_two_backends().await;
    cheap.set_persistent_failure(Some(RawFailure::Timeout("slow".into())));

    let response = engine
        .execute_with_fallback(
            ("cheap", "cheap-model"),
            ("pricey", "pricey-model"),
            &BackendRequest::new("hello"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(response.model_used, "pricey-model");

    let err = engine
        .execute_with_fallback(
            ("cheap", "cheap-model"),
            ("missing", "m"),
            &BackendRequest::new("hello"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownBackend(ref id) if id == "missing"));
}

#[tokio::test(start_paused = true)]
async fn test_stream_through_engine() {
    let (engine, _cheap, _pricey) = engine_with_two_backends().await;
    let stream = engine
        .stream("cheap", "cheap-model", &BackendRequest::new("hello"), None)
        .await
        .unwrap();
    let fragments: Vec<_> = stream.collect().await;
    assert!(fragments.len() >= 2);
    assert!(fragments.iter().all(|f| f.is_ok()));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_backend_operations() {
    let engine = ResilienceEngine::new(test_config()).unwrap();
    assert!(matches!(
        engine.refresh_capabilities("ghost").await,
        Err(DispatchError::UnknownBackend(_))
    ));
    assert!(matches!(
        engine.invoke("ghost", "m", &BackendRequest::new("hi"), None).await,
        Err(DispatchError::UnknownBackend(_))
    ));
    assert!(matches!(
        engine.select(&SelectionCriteria::new()),
        Err(DispatchError::NoEligibleBackend { .. })
    ));
    assert_eq!(engine.get_circuit_state("ghost"), CircuitState::Closed);
    assert_eq!(engine.get_metrics("ghost").total_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_compare_backends_reports_certification_gap() {
    let engine = Arc::new(ResilienceEngine::new(test_config()).unwrap());
    engine.register_backend(Arc::new(
        MockBackend::fully_capable("a").with_profile(BackendProfile::default().with_certification("soc2")),
    ));
    engine.register_backend(Arc::new(MockBackend::fully_capable("b")));
    engine.refresh_all().await;

    let comparison = engine.compare_backends("a", "b").unwrap();
    assert!(comparison.score < 1.0);
    assert!(
        comparison
            .differences
            .iter()
            .any(|d| d.path == "certifications.soc2")
    );
    assert!(engine.compare_backends("a", "missing").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_loop_populates_cache_and_stops() {
    let mut config = test_config();
    config.probe.refresh_interval = Duration::from_secs(60);
    let engine = Arc::new(ResilienceEngine::new(config).unwrap());
    engine.register_backend(Arc::new(MockBackend::fully_capable("one")));
    engine.register_backend(Arc::new(MockBackend::fully_capable("two")));
    assert!(engine.get_capabilities("one").is_none());

    let handle = engine.spawn_refresh_loop();
    assert_eq!(handle.task_count(), 2);

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(engine.get_capabilities("one").is_some());
    assert!(engine.get_capabilities("two").is_some());

    handle.shutdown().await;
}
