use super::*;
use crate::circuit::{CircuitBreakerConfig, CircuitRegistry, CircuitState};
use crate::error::{DispatchError, ErrorKind, RawFailure};
use crate::retry::{ExponentialBackoff, FixedDelay, RetryConfig, RetryRegistry, RetryStrategy};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn executor(threshold: u32, strategy: Arc<dyn RetryStrategy>) -> ResilientExecutor {
    executor_with(threshold, RetryRegistry::shared(strategy))
}

fn executor_with(threshold: u32, retries: RetryRegistry) -> ResilientExecutor {
    let circuits = CircuitRegistry::new(CircuitBreakerConfig {
        failure_threshold: threshold,
        recovery_timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
    });
    ResilientExecutor::new(
        Arc::new(circuits),
        Arc::new(retries),
        Arc::new(MetricsRegistry::default()),
    )
}

fn no_retry() -> Arc<dyn RetryStrategy> {
    Arc::new(FixedDelay::new(Duration::from_millis(10), 1))
}

/// Operation that fails with `failure` for the first `failures` calls, then
/// succeeds with the call number.
fn scripted(
    calls: &Arc<AtomicUsize>,
    failures: usize,
    failure: RawFailure,
) -> impl FnMut() -> std::future::Ready<Result<usize, RawFailure>> {
    let calls = Arc::clone(calls);
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            std::future::ready(Err(failure.clone()))
        } else {
            std::future::ready(Ok(n))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_sixth_call_rejected_without_reaching_backend() {
    let executor = executor(5, no_retry());
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let err = executor
            .execute("backend-a", None, scripted(&calls, usize::MAX, RawFailure::http(503, "unavailable")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError);
    }
    assert_eq!(executor.circuits().state("backend-a"), CircuitState::Open);

    let err = executor
        .execute("backend-a", None, scripted(&calls, usize::MAX, RawFailure::http(503, "unavailable")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert!(!err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let metrics = executor.metrics().snapshot("backend-a");
    assert_eq!(metrics.failures, 5);
    assert_eq!(metrics.circuit_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_then_succeeds() {
    let strategy = Arc::new(FixedDelay::new(Duration::from_millis(100), 3));
    let executor = executor(5, strategy);
    let calls = Arc::new(AtomicUsize::new(0));

    let value = executor
        .execute("backend-a", None, scripted(&calls, 2, RawFailure::Transport("reset".into())))
        .await
        .expect("third attempt succeeds");
    assert_eq!(value, 3);

    let metrics = executor.metrics().snapshot("backend-a");
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.successes, 1);
    assert_eq!(metrics.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_hint_delays_next_attempt() {
    let strategy = Arc::new(ExponentialBackoff::new(
        Duration::from_millis(100),
        Duration::from_secs(1),
        3,
    ));
    let executor = executor(5, strategy);
    let calls = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let value = executor
        .execute(
            "backend-a",
            None,
            scripted(&calls, 1, RawFailure::rate_limited(Duration::from_secs(30))),
        )
        .await
        .expect("succeeds after the hinted wait");
    assert_eq!(value, 2);
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_authentication_is_not_retried() {
    let strategy = Arc::new(FixedDelay::new(Duration::from_millis(10), 5));
    let executor = executor(5, strategy);
    let calls = Arc::new(AtomicUsize::new(0));

    let err = executor
        .execute("backend-a", None, scripted(&calls, usize::MAX, RawFailure::http(401, "bad key")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Auth failures do not count toward the breaker.
    assert_eq!(
        executor.circuits().snapshot("backend-a").unwrap().consecutive_failures,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opening_mid_sequence_stops_retries() {
    let strategy = Arc::new(FixedDelay::new(Duration::from_millis(10), 10));
    let executor = executor(2, strategy);
    let calls = Arc::new(AtomicUsize::new(0));

    let err = executor
        .execute("backend-a", None, scripted(&calls, usize::MAX, RawFailure::http(500, "boom")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_abandons_retries() {
    let strategy = Arc::new(FixedDelay::new(Duration::from_secs(5), 10));
    let executor = executor(100, strategy);
    let calls = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let deadline = started + Duration::from_secs(12);
    let err = executor
        .execute("backend-a", Some(deadline), scripted(&calls, usize::MAX, RawFailure::http(502, "bad gateway")))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.context().get("deadline_exceeded"), Some(&serde_json::json!(true)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(Instant::now() <= deadline);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cuts_slow_attempt() {
    let executor = executor(5, no_retry());
    let deadline = Instant::now() + Duration::from_millis(50);

    let err = executor
        .execute("backend-a", Some(deadline), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, RawFailure>(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    // Abandoned calls do not move the breaker.
    assert_eq!(
        executor.circuits().snapshot("backend-a").unwrap().consecutive_failures,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_counts_as_failure() {
    let executor = executor(5, no_retry()).with_attempt_timeout(Some(Duration::from_millis(100)));

    let err = executor
        .execute("backend-a", None, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, RawFailure>(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(
        executor.circuits().snapshot("backend-a").unwrap().consecutive_failures,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_fallback_carries_both_errors() {
    let executor = executor(5, no_retry());
    let primary_calls = Arc::new(AtomicUsize::new(0));
    let fallback_calls = Arc::new(AtomicUsize::new(0));

    let err = executor
        .execute_with_fallback(
            ("primary", scripted(&primary_calls, usize::MAX, RawFailure::http(500, "down"))),
            ("fallback", scripted(&fallback_calls, usize::MAX, RawFailure::http(401, "denied"))),
            None,
        )
        .await
        .unwrap_err();

    match &err {
        DispatchError::FallbackExhausted { primary, fallback } => {
            assert_eq!(primary.backend_id(), "primary");
            assert_eq!(primary.kind(), ErrorKind::ServerError);
            assert_eq!(fallback.backend_id(), "fallback");
            assert_eq!(fallback.kind(), ErrorKind::Authentication);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.records().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_used_when_primary_fails() {
    let executor = executor(5, no_retry());
    let primary_calls = Arc::new(AtomicUsize::new(0));
    let fallback_calls = Arc::new(AtomicUsize::new(0));

    let value = executor
        .execute_with_fallback(
            ("primary", scripted(&primary_calls, usize::MAX, RawFailure::Timeout("slow".into()))),
            ("fallback", scripted(&fallback_calls, 0, RawFailure::Other("unused".into()))),
            None,
        )
        .await
        .expect("fallback succeeds");
    assert_eq!(value, 1);
    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_quota_is_flagged() {
    let executor = executor(5, no_retry());
    let calls = Arc::new(AtomicUsize::new(0));

    executor
        .execute("backend-a", None, scripted(&calls, usize::MAX, RawFailure::http(402, "billing")))
        .await
        .unwrap_err();
    assert!(executor.metrics().is_deprioritized("backend-a"));
    assert!(executor.metrics().snapshot("backend-a").quota_exhausted);

    executor.metrics().clear_quota_flag("backend-a");
    assert!(!executor.metrics().is_deprioritized("backend-a"));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_exhaustion_cools_down() {
    let executor = executor(100, no_retry());
    let calls = Arc::new(AtomicUsize::new(0));

    executor
        .execute("backend-a", None, scripted(&calls, usize::MAX, RawFailure::http(429, "too many requests")))
        .await
        .unwrap_err();
    assert!(executor.metrics().is_deprioritized("backend-a"));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!executor.metrics().is_deprioritized("backend-a"));
}

fn adaptive_retries(max_attempts: u32) -> RetryRegistry {
    RetryRegistry::new(RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(10),
        jitter: 0.0,
        ..Default::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_failing_backend_does_not_shrink_healthy_retry_budget() {
    let executor = executor_with(100, adaptive_retries(4));
    let bad_calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        executor
            .execute("bad", None, scripted(&bad_calls, usize::MAX, RawFailure::http(500, "boom")))
            .await
            .unwrap_err();
    }
    assert_eq!(executor.retries().strategy("bad").max_attempts(), 2);

    let good_calls = Arc::new(AtomicUsize::new(0));
    let value = executor
        .execute("good", None, scripted(&good_calls, 2, RawFailure::http(503, "unavailable")))
        .await
        .expect("third attempt succeeds within the configured budget");
    assert_eq!(value, 3);
    assert_eq!(executor.retries().strategy("good").max_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_do_not_feed_adaptive_window() {
    let executor = executor_with(100, adaptive_retries(4));
    let calls = Arc::new(AtomicUsize::new(0));

    for failure in [RawFailure::http(400, "invalid request"), RawFailure::http(401, "bad key")] {
        for _ in 0..10 {
            executor
                .execute("picky", None, scripted(&calls, usize::MAX, failure.clone()))
                .await
                .unwrap_err();
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 20);
    assert_eq!(executor.retries().strategy("picky").max_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_cut_off_by_deadline_cools_down() {
    let strategy = Arc::new(FixedDelay::new(Duration::from_millis(10), 5));
    let executor = executor(100, strategy);
    let calls = Arc::new(AtomicUsize::new(0));

    let deadline = Instant::now() + Duration::from_secs(5);
    let err = executor
        .execute(
            "backend-a",
            Some(deadline),
            scripted(&calls, usize::MAX, RawFailure::rate_limited(Duration::from_secs(30))),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(executor.metrics().is_deprioritized("backend-a"));
    assert!(executor.metrics().snapshot("backend-a").rate_limit_exhausted);
}
