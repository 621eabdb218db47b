use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use resilience::{BreakerState, CallError, Gate, GateConfig, GateError, UnavailableReason};

fn config() -> GateConfig {
    GateConfig {
        window_size: 10,
        minimum_calls: 4,
        failure_rate_threshold: 0.5,
        cooldown: Duration::from_secs(10),
        call_timeout: Duration::from_millis(500),
        max_retries: 2,
        base_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        ..GateConfig::default()
    }
}

/// Operation that fails transiently `failures` times, then succeeds.
fn flaky(calls: &Arc<AtomicU32>, failures: u32) -> impl FnMut() -> std::future::Ready<Result<u32, CallError>> {
    let calls = calls.clone();
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            std::future::ready(Err(CallError::Transient(format!("attempt {n} refused"))))
        } else {
            std::future::ready(Ok(n))
        }
    }
}

async fn trip(gate: &Gate) {
    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..4 {
        let _ = gate.call(flaky(&calls, u32::MAX)).await;
        if gate.state() == BreakerState::Open {
            break;
        }
    }
    assert_eq!(gate.state(), BreakerState::Open);
}

#[tokio::test(start_paused = true)]
async fn retries_transient_failures_then_succeeds() {
    let gate = Gate::new("club-service", &config());
    let calls = Arc::new(AtomicU32::new(0));

    let result = gate.call(flaky(&calls, 2)).await;

    assert_eq!(result, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let snap = gate.breaker().snapshot();
    assert_eq!(snap.total, 3);
    assert_eq!(snap.failures, 2);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_retry_budget() {
    let gate = Gate::new("club-service", &config());
    let calls = Arc::new(AtomicU32::new(0));

    let result = gate.call(flaky(&calls, u32::MAX)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match result {
        Err(GateError::Unavailable {
            dependency,
            reason: UnavailableReason::RetriesExhausted { attempts, .. },
        }) => {
            assert_eq!(dependency, "club-service");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn slow_attempt_times_out() {
    let gate = Gate::new(
        "user-service",
        &GateConfig {
            max_retries: 0,
            ..config()
        },
    );

    let result: Result<(), _> = gate
        .call(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

    match result {
        Err(GateError::Unavailable {
            reason: UnavailableReason::RetriesExhausted { last_error, .. },
            ..
        }) => assert!(last_error.contains("timed out")),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn semantic_errors_are_not_retried_and_keep_circuit_closed() {
    let gate = Gate::new("club-service", &config());
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..10 {
        let calls = calls.clone();
        let result: Result<(), _> = gate
            .call(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(CallError::NotFound("club Tigers".into())))
            })
            .await;
        assert_eq!(result, Err(GateError::NotFound("club Tigers".into())));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(gate.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_rejects_without_calling_remote() {
    let gate = Gate::new("training-service", &config());
    trip(&gate).await;

    let calls = Arc::new(AtomicU32::new(0));
    let result = gate.call(flaky(&calls, 0)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        result,
        Err(GateError::Unavailable {
            dependency: "training-service".into(),
            reason: UnavailableReason::CircuitOpen,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn half_open_allows_one_probe_and_closes_on_success() {
    let gate = Gate::new("training-service", &config());
    trip(&gate).await;
    tokio::time::advance(Duration::from_secs(10)).await;

    let probe_calls = Arc::new(AtomicU32::new(0));
    let probe = {
        let probe_calls = probe_calls.clone();
        gate.call(move || {
            let probe_calls = probe_calls.clone();
            async move {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, CallError>("pong")
            }
        })
    };
    let competitor = async {
        tokio::task::yield_now().await;
        gate.call(|| async { Ok::<_, CallError>("other") }).await
    };

    let (probe_result, competitor_result) = tokio::join!(probe, competitor);

    assert_eq!(probe_result, Ok("pong"));
    assert_eq!(probe_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        competitor_result,
        Err(GateError::Unavailable {
            reason: UnavailableReason::CircuitOpen,
            ..
        })
    ));
    assert_eq!(gate.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_circuit() {
    let gate = Gate::new("training-service", &config());
    trip(&gate).await;
    tokio::time::advance(Duration::from_secs(10)).await;

    let calls = Arc::new(AtomicU32::new(0));
    let result = gate.call(flaky(&calls, u32::MAX)).await;

    assert!(matches!(result, Err(GateError::Unavailable { .. })));
    // The probe failed and the retry was turned away by the reopened circuit.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(gate.state(), BreakerState::Open);
}

#[tokio::test(start_paused = true)]
async fn half_open_call_cancelled_by_caller_deadline_reopens_circuit() {
    let gate = Gate::new("club-service", &config());
    trip(&gate).await;
    tokio::time::advance(Duration::from_secs(11)).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        gate.call(|| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<_, CallError>("late")
        }),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(gate.state(), BreakerState::Open);

    tokio::time::advance(Duration::from_secs(10)).await;
    let calls = Arc::new(AtomicU32::new(0));
    let result = gate.call(flaky(&calls, 0)).await;

    assert_eq!(result, Ok(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(gate.state(), BreakerState::Closed);
}
