//! Supervised worker pool.
//!
//! ```text
//!  supervisor 0 ──▶ worker loop ──▶ pop ──▶ backend ──▶ resolve/fail
//!  supervisor 1 ──▶ worker loop ──▶ ...
//!      ▲                 │
//!      └──── panic ──────┘  restart after backoff, queue untouched
//! ```
//!
//! Workers never hold the queue lock while the backend runs. Backend
//! panics are caught around the call itself and fail only the request
//! being translated; any other panic unwinds the worker loop, the in-flight
//! guard fails the current request, and the supervisor starts a new loop.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::InferenceEngine;
use crate::error::{CancelReason, RequestError};
use crate::metrics::MetricsRegistry;
use crate::queue::{PriorityQueue, QueueEntry};
use crate::registry::{HandleState, Outcome, RegistryError, ResultRegistry, Translation};
use crate::request::RequestId;

/// Everything a worker needs, shared by all workers
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<PriorityQueue>,
    pub registry: Arc<ResultRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub engine: Arc<dyn InferenceEngine>,
    pub inference_timeout: Duration,
    pub restart_backoff: Duration,
}

/// Fixed-size pool of supervised workers
pub struct WorkerPool {
    supervisors: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` supervised workers pulling from `ctx.queue`
    pub fn spawn(workers: usize, ctx: WorkerContext) -> Self {
        ctx.metrics.set_workers(workers);

        let supervisors = (0..workers)
            .map(|worker_id| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let metrics = ctx.metrics.clone();
                    let backoff = ctx.restart_backoff;
                    supervise(worker_id, metrics, backoff, move || {
                        run_worker(worker_id, ctx.clone())
                    })
                    .await
                })
            })
            .collect();

        info!(workers, "Worker pool started");
        Self { supervisors }
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Wait for every worker to exit (the queue must be closed for that).
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let all = futures::future::join_all(self.supervisors.iter_mut());
        match tokio::time::timeout(timeout, all).await {
            Ok(_) => {
                self.supervisors.clear();
                true
            }
            Err(_) => false,
        }
    }

    /// Stop every worker immediately
    pub fn abort(&self) {
        for supervisor in &self.supervisors {
            supervisor.abort();
        }
    }
}

/// Run `body` until it returns normally, restarting it whenever it panics
async fn supervise<F, Fut>(
    worker_id: usize,
    metrics: Arc<MetricsRegistry>,
    backoff: Duration,
    mut body: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        match AssertUnwindSafe(body()).catch_unwind().await {
            Ok(()) => {
                debug!(worker_id, "Worker stopped");
                return;
            }
            Err(panic) => {
                error!(
                    worker_id,
                    panic = %panic_message(panic.as_ref()),
                    "Worker crashed, restarting"
                );
                metrics.record_worker_restart();
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn run_worker(worker_id: usize, ctx: WorkerContext) {
    debug!(worker_id, engine = ctx.engine.name(), "Worker started");
    while let Some(entry) = ctx.queue.pop().await {
        process(worker_id, &ctx, entry).await;
    }
}

/// Handle one dequeued entry
async fn process(worker_id: usize, ctx: &WorkerContext, entry: QueueEntry) {
    let QueueEntry { tier, sequence, request } = entry;
    let id = request.id;

    if request.is_expired() {
        let _ = ctx.registry.cancel(id, CancelReason::DeadlineExceeded);
        ctx.metrics.record_discarded(tier);
        debug!(worker_id, request_id = %id, priority = %tier, "Skipping request expired in queue");
        return;
    }

    if !ctx.registry.mark_dispatched(id) {
        ctx.metrics.record_discarded(tier);
        debug!(worker_id, request_id = %id, priority = %tier, "Skipping cancelled request");
        return;
    }

    let queued_for = request.waited();
    debug!(
        worker_id,
        request_id = %id,
        priority = %tier,
        sequence,
        queued_ms = queued_for.as_millis() as u64,
        text = %request.payload.preview(),
        "Dequeued job"
    );

    let guard = InFlight::new(id, &ctx.registry, &ctx.metrics);
    let started = Instant::now();

    let call = AssertUnwindSafe(ctx.engine.translate(&request.payload)).catch_unwind();
    let outcome: Outcome = match tokio::time::timeout(ctx.inference_timeout, call).await {
        Ok(Ok(Ok(text))) => Ok(Translation {
            id,
            priority: tier,
            text,
            queued_for,
            processing_time: started.elapsed(),
        }),
        Ok(Ok(Err(e))) => Err(RequestError::engine(e.to_string())),
        Ok(Err(panic)) => {
            error!(worker_id, request_id = %id, "Backend panicked during translation");
            Err(RequestError::internal(format!(
                "internal fault: {}",
                panic_message(panic.as_ref())
            )))
        }
        Err(_) => Err(RequestError::InferenceTimeout { after: ctx.inference_timeout }),
    };

    let elapsed = started.elapsed();
    ctx.metrics.record_processing(tier, elapsed);
    guard.disarm();

    match &outcome {
        Ok(_) => debug!(worker_id, request_id = %id, elapsed_ms = elapsed.as_millis() as u64, "Job finished"),
        Err(e) => warn!(worker_id, request_id = %id, priority = %tier, error = %e, "Job failed"),
    }
    deliver(&ctx.registry, id, outcome);
}

fn deliver(registry: &ResultRegistry, id: RequestId, outcome: Outcome) {
    let result = match outcome {
        Ok(translation) => registry.resolve(id, translation),
        Err(error) => registry.fail(id, error),
    };

    match result {
        Ok(()) => {}
        // The caller stopped waiting while the backend ran
        Err(RegistryError::AlreadyTerminal { state: HandleState::Cancelled, .. }) => {
            debug!(request_id = %id, "Result arrived after cancellation, dropped");
        }
        // The handle was dropped and its slot removed
        Err(RegistryError::Unknown(_)) => {
            debug!(request_id = %id, "Result for released request dropped");
        }
        Err(e) => warn!(request_id = %id, error = %e, "Duplicate resolution ignored"),
    }
}

/// Marks a worker as busy for the duration of a backend call and fails the
/// request if the worker unwinds before delivering a result.
struct InFlight<'a> {
    id: RequestId,
    registry: &'a ResultRegistry,
    metrics: &'a MetricsRegistry,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(id: RequestId, registry: &'a ResultRegistry, metrics: &'a MetricsRegistry) -> Self {
        metrics.worker_busy();
        Self { id, registry, metrics, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.worker_idle();
        if self.armed {
            error!(request_id = %self.id, "Worker fault while handling request");
            let _ = self
                .registry
                .fail(self.id, RequestError::internal("internal fault: worker crashed"));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
