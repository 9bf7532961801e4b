//! End-to-end tests for the dispatcher against a scripted backend

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use mtqueue_core::{
    CancelReason, DispatchConfig, Dispatcher, EngineError, FailureKind, InferenceEngine, Payload,
    PriorityTier, RejectionReason, RequestError, ResultHandle,
};

/// Records every call and blocks each one on a permit.
///
/// Texts `fail`, `panic` and `slow` trigger the matching misbehaviour.
struct ScriptedEngine {
    gate: Semaphore,
    calls: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    fn open() -> Arc<Self> {
        Arc::new(Self { gate: Semaphore::new(Semaphore::MAX_PERMITS), calls: Mutex::new(Vec::new()) })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self { gate: Semaphore::new(0), calls: Mutex::new(Vec::new()) })
    }

    fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn translate(&self, payload: &Payload) -> Result<String, EngineError> {
        self.calls.lock().unwrap().push(payload.text.clone());
        self.gate
            .acquire()
            .await
            .map_err(|_| EngineError::unavailable("gate closed"))?
            .forget();

        match payload.text.as_str() {
            "fail" => Err(EngineError::backend("unsupported sentence")),
            "panic" => panic!("model state corrupted"),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            }
            text => Ok(format!("fr:{}", text)),
        }
    }
}

fn config(workers: usize) -> DispatchConfig {
    DispatchConfig {
        workers,
        restart_backoff: Duration::from_millis(1),
        ..DispatchConfig::single_worker()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn submit(dispatcher: &Dispatcher, text: &str, tier: PriorityTier) -> ResultHandle {
    dispatcher.submit(Payload::new(text), tier, None).await.unwrap()
}

/// Occupy the single worker with a blocked call
async fn occupy_worker(dispatcher: &Dispatcher, engine: &ScriptedEngine) -> ResultHandle {
    let handle = submit(dispatcher, "block", PriorityTier::P3).await;
    wait_until(|| engine.calls().len() == 1).await;
    handle
}

#[tokio::test]
async fn test_strict_priority_order() {
    let engine = ScriptedEngine::gated();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();
    let blocker = occupy_worker(&dispatcher, &engine).await;

    let mut handles = vec![blocker];
    for (text, tier) in [
        ("a", PriorityTier::P3),
        ("b", PriorityTier::P2),
        ("c", PriorityTier::P0),
        ("d", PriorityTier::P1),
        ("e", PriorityTier::P0),
    ] {
        handles.push(submit(&dispatcher, text, tier).await);
    }

    engine.release(10);
    for handle in handles {
        handle.wait().await.unwrap();
    }

    assert_eq!(engine.calls(), vec!["block", "c", "e", "d", "b", "a"]);
}

#[tokio::test]
async fn test_fifo_within_tier() {
    let engine = ScriptedEngine::gated();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();
    let blocker = occupy_worker(&dispatcher, &engine).await;

    let mut handles = vec![blocker];
    for i in 0..5 {
        handles.push(submit(&dispatcher, &format!("t{}", i), PriorityTier::P2).await);
    }

    engine.release(10);
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(engine.calls(), vec!["block", "t0", "t1", "t2", "t3", "t4"]);
}

#[tokio::test]
async fn test_reserved_capacity_survives_low_priority_flood() {
    let engine = ScriptedEngine::gated();
    let config = DispatchConfig { shared_capacity: 4, reserved: [2, 0, 0, 0], ..config(1) };
    let dispatcher = Dispatcher::start(config, engine.clone()).unwrap();
    let mut handles = vec![occupy_worker(&dispatcher, &engine).await];

    for i in 0..4 {
        handles.push(submit(&dispatcher, &format!("bulk{}", i), PriorityTier::P3).await);
    }
    let rejection = dispatcher
        .submit(Payload::new("bulk4"), PriorityTier::P3, None)
        .await
        .unwrap_err();
    assert_eq!(rejection.reason, RejectionReason::GlobalCapacityExceeded { capacity: 4 });

    // The P0 reserve is still free
    handles.push(submit(&dispatcher, "urgent0", PriorityTier::P0).await);
    handles.push(submit(&dispatcher, "urgent1", PriorityTier::P0).await);

    let rejection = dispatcher
        .submit(Payload::new("urgent2"), PriorityTier::P0, None)
        .await
        .unwrap_err();
    assert_eq!(
        rejection.reason,
        RejectionReason::TierCapacityExceeded { tier: PriorityTier::P0, reserved: 2 }
    );
    assert!(dispatcher.submit(Payload::new("x"), PriorityTier::P1, None).await.is_err());

    let snapshot = dispatcher.snapshot();
    assert_eq!(snapshot.tier(PriorityTier::P3).rejected, 1);
    assert_eq!(snapshot.tier(PriorityTier::P0).rejected, 1);
    assert_eq!(snapshot.tier(PriorityTier::P1).rejected, 1);
    assert_eq!(dispatcher.queue_len(), 6);

    engine.release(10);
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(&engine.calls()[1..3], &["urgent0", "urgent1"]);
}

#[tokio::test]
async fn test_backend_failure_is_isolated() {
    let engine = ScriptedEngine::open();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();

    let bad = submit(&dispatcher, "fail", PriorityTier::P1).await;
    let good = submit(&dispatcher, "fine", PriorityTier::P1).await;

    let err = bad.wait().await.unwrap_err();
    assert!(matches!(err, RequestError::Inference { kind: FailureKind::Engine, .. }));
    assert_eq!(good.wait().await.unwrap().text, "fr:fine");

    let p1 = dispatcher.snapshot().tier(PriorityTier::P1).clone();
    assert_eq!(p1.failed, 1);
    assert_eq!(p1.completed, 1);
}

#[tokio::test]
async fn test_backend_timeout_frees_worker() {
    let engine = ScriptedEngine::open();
    let config = DispatchConfig { inference_timeout: Duration::from_millis(50), ..config(1) };
    let dispatcher = Dispatcher::start(config, engine.clone()).unwrap();

    let slow = submit(&dispatcher, "slow", PriorityTier::P2).await;
    let next = submit(&dispatcher, "next", PriorityTier::P2).await;

    assert_eq!(
        slow.wait().await,
        Err(RequestError::InferenceTimeout { after: Duration::from_millis(50) })
    );
    assert_eq!(next.wait().await.unwrap().text, "fr:next");
    assert_eq!(dispatcher.snapshot().tier(PriorityTier::P2).timed_out, 1);
}

#[tokio::test]
async fn test_backend_panic_does_not_kill_worker() {
    let engine = ScriptedEngine::open();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();

    let crashing = submit(&dispatcher, "panic", PriorityTier::P0).await;
    let survivor = submit(&dispatcher, "after", PriorityTier::P0).await;

    let err = crashing.wait().await.unwrap_err();
    assert!(matches!(err, RequestError::Inference { kind: FailureKind::Internal, .. }));
    assert_eq!(survivor.wait().await.unwrap().text, "fr:after");
    assert_eq!(dispatcher.snapshot().active_workers, 0);
}

#[tokio::test]
async fn test_deadline_in_queue_never_reaches_backend() {
    let engine = ScriptedEngine::gated();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();
    let blocker = occupy_worker(&dispatcher, &engine).await;

    let expiring = dispatcher
        .submit(Payload::new("expiring"), PriorityTier::P2, Some(Duration::from_millis(30)))
        .await
        .unwrap();
    assert_eq!(
        expiring.wait().await,
        Err(RequestError::cancelled(CancelReason::DeadlineExceeded))
    );

    engine.release(10);
    blocker.wait().await.unwrap();
    submit(&dispatcher, "flush", PriorityTier::P3).await.wait().await.unwrap();

    assert_eq!(engine.calls(), vec!["block", "flush"]);
    let p2 = dispatcher.snapshot().tier(PriorityTier::P2).clone();
    assert_eq!(p2.cancelled, 1);
    assert_eq!(p2.discarded, 1);
    assert_eq!(p2.processing_time.count, 0);
}

#[tokio::test]
async fn test_explicit_and_caller_gone_cancellation() {
    let engine = ScriptedEngine::gated();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();
    let blocker = occupy_worker(&dispatcher, &engine).await;

    let cancelled = submit(&dispatcher, "cancelled", PriorityTier::P1).await;
    assert!(dispatcher.cancel(cancelled.id()));
    assert!(!dispatcher.cancel(cancelled.id()));

    let abandoned = submit(&dispatcher, "abandoned", PriorityTier::P1).await;
    drop(abandoned);

    engine.release(10);
    blocker.wait().await.unwrap();
    assert_eq!(
        cancelled.wait().await,
        Err(RequestError::cancelled(CancelReason::Explicit))
    );
    submit(&dispatcher, "flush", PriorityTier::P3).await.wait().await.unwrap();

    assert_eq!(engine.calls(), vec!["block", "flush"]);
    let p1 = dispatcher.snapshot().tier(PriorityTier::P1).clone();
    assert_eq!(p1.cancelled, 2);
    assert_eq!(p1.discarded, 2);
}

#[tokio::test]
async fn test_abandoned_admission_wait_counts_nothing() {
    let engine = ScriptedEngine::gated();
    let config = DispatchConfig {
        shared_capacity: 1,
        reserved: [0; 4],
        admission_wait: Some(Duration::from_secs(5)),
        ..config(1)
    };
    let dispatcher = Dispatcher::start(config, engine.clone()).unwrap();
    let blocker = occupy_worker(&dispatcher, &engine).await;
    let queued = submit(&dispatcher, "queued", PriorityTier::P3).await;

    // Full queue: the submit parks until the caller gives up on it
    let waiting = dispatcher.submit(Payload::new("impatient"), PriorityTier::P2, None);
    assert!(tokio::time::timeout(Duration::from_millis(50), waiting).await.is_err());

    engine.release(10);
    blocker.wait().await.unwrap();
    queued.wait().await.unwrap();

    let p2 = dispatcher.snapshot().tier(PriorityTier::P2).clone();
    assert_eq!(p2.admitted, 0);
    assert_eq!(p2.cancelled, 0);
    assert!(p2.finished() <= p2.admitted);
    assert_eq!(engine.calls(), vec!["block", "queued"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_resolve_exactly_once() {
    let engine = ScriptedEngine::open();
    let config = DispatchConfig { shared_capacity: 1024, ..config(4) };
    let dispatcher = Arc::new(Dispatcher::start(config, engine.clone()).unwrap());

    let mut tasks = Vec::new();
    for producer in 0..8 {
        let dispatcher = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let text = format!("p{}-{}", producer, i);
                let tier = PriorityTier::ALL[i % PriorityTier::COUNT];
                let handle = dispatcher.submit(Payload::new(text.clone()), tier, None).await.unwrap();
                let translation = handle.wait().await.unwrap();
                assert_eq!(translation.text, format!("fr:{}", text));
                assert_eq!(translation.priority, tier);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut calls = engine.calls();
    calls.sort();
    calls.dedup();
    assert_eq!(calls.len(), 200);

    let snapshot = dispatcher.snapshot();
    assert_eq!(snapshot.total_admitted(), 200);
    for tier in &snapshot.tiers {
        assert_eq!(tier.admitted, tier.finished());
        assert_eq!(tier.queue_depth, 0);
        assert_eq!(tier.wait_time.count, tier.admitted);
        assert_eq!(tier.processing_time.count, tier.completed);
    }
    assert_eq!(snapshot.active_workers, 0);
}

#[tokio::test]
async fn test_graceful_shutdown_drains_queue() {
    let engine = ScriptedEngine::gated();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();
    let mut handles = vec![occupy_worker(&dispatcher, &engine).await];
    for i in 0..3 {
        handles.push(submit(&dispatcher, &format!("q{}", i), PriorityTier::P2).await);
    }

    engine.release(10);
    let report = dispatcher.shutdown(Duration::from_secs(2)).await;
    assert!(report.graceful);
    assert_eq!(report.abandoned, 0);

    for handle in handles {
        assert!(handle.wait().await.is_ok());
    }
    assert_eq!(engine.calls().len(), 4);
}

#[tokio::test]
async fn test_shutdown_timeout_cancels_remaining_work() {
    let engine = ScriptedEngine::gated();
    let dispatcher = Dispatcher::start(config(1), engine.clone()).unwrap();
    let blocker = occupy_worker(&dispatcher, &engine).await;
    let queued = submit(&dispatcher, "queued", PriorityTier::P0).await;

    let report = dispatcher.shutdown(Duration::from_millis(50)).await;
    assert!(!report.graceful);
    assert_eq!(report.abandoned, 2);

    for handle in [blocker, queued] {
        assert_eq!(handle.wait().await, Err(RequestError::cancelled(CancelReason::Shutdown)));
    }
    assert_eq!(dispatcher.queue_len(), 0);
    assert_eq!(engine.calls(), vec!["block"]);
}
