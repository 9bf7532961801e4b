//! The dispatcher ties admission, the queue, the registry and the worker
//! pool together behind `submit`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, Rejection};
use crate::config::DispatchConfig;
use crate::engine::InferenceEngine;
use crate::error::{CancelReason, ConfigError};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::queue::PriorityQueue;
use crate::registry::{ResultHandle, ResultRegistry};
use crate::request::{Payload, Request, RequestId};
use crate::tier::PriorityTier;
use crate::worker::{WorkerContext, WorkerPool};

/// What happened during [`Dispatcher::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every queued request was processed before the drain timeout
    pub graceful: bool,
    /// Requests cancelled with `CancelReason::Shutdown`
    pub abandoned: usize,
}

/// Priority-aware dispatch engine
pub struct Dispatcher {
    config: DispatchConfig,
    engine: Arc<dyn InferenceEngine>,
    metrics: Arc<MetricsRegistry>,
    queue: Arc<PriorityQueue>,
    registry: Arc<ResultRegistry>,
    admission: AdmissionController,
    pool: Mutex<WorkerPool>,
    janitor: JoinHandle<()>,
}

impl Dispatcher {
    /// Validate `config`, build every component and start the workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: DispatchConfig,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(MetricsRegistry::new());
        let queue = Arc::new(PriorityQueue::new(config.queue_capacity(), metrics.clone()));
        let registry = Arc::new(ResultRegistry::new(metrics.clone()));
        let admission =
            AdmissionController::new(config.admission_policy(), queue.clone(), metrics.clone());

        let pool = WorkerPool::spawn(
            config.workers,
            WorkerContext {
                queue: queue.clone(),
                registry: registry.clone(),
                metrics: metrics.clone(),
                engine: engine.clone(),
                inference_timeout: config.inference_timeout,
                restart_backoff: config.restart_backoff,
            },
        );

        let janitor = spawn_janitor(registry.clone(), config.janitor_interval, config.result_grace);

        info!(
            engine = engine.name(),
            workers = config.workers,
            shared_capacity = config.shared_capacity,
            reserved = ?config.reserved,
            "Dispatcher started"
        );

        Ok(Self {
            config,
            engine,
            metrics,
            queue,
            registry,
            admission,
            pool: Mutex::new(pool),
            janitor,
        })
    }

    /// Submit a payload at `tier`.
    ///
    /// Returns a handle on admission or a [`Rejection`] immediately (or after
    /// the configured admission wait). A rejected request leaves no trace in
    /// the queue or the registry.
    pub async fn submit(
        &self,
        payload: Payload,
        tier: PriorityTier,
        deadline: Option<Duration>,
    ) -> Result<ResultHandle, Rejection> {
        let mut request = Request::new(tier, payload, deadline.or(self.config.default_deadline));

        // Register first so a fast worker always finds the slot.
        // Ids are random; a collision just draws a new one.
        let handle = loop {
            match self.registry.register(request.id, tier, request.deadline) {
                Ok(handle) => break handle,
                Err(_) => request = request.with_id(RequestId::new()),
            }
        };

        match self.admission.admit(request).await {
            Ok(sequence) => {
                self.registry.mark_admitted(handle.id());
                debug!(request_id = %handle.id(), priority = %tier, sequence, "Request admitted");
                Ok(handle)
            }
            Err(rejection) => {
                self.registry.discard(handle.id());
                Err(rejection)
            }
        }
    }

    /// Cancel a pending request by id
    pub fn cancel(&self, id: RequestId) -> bool {
        self.registry.cancel(id, CancelReason::Explicit).is_ok()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Entries currently waiting at `tier`
    pub fn queue_depth(&self, tier: PriorityTier) -> usize {
        self.queue.depth(tier)
    }

    /// Entries currently waiting across all tiers
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    pub fn is_accepting(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Stop admitting, let workers finish what is queued, then stop them.
    ///
    /// If the queue is not drained within `drain_timeout`, the remaining
    /// entries and any in-flight work are cancelled with
    /// `CancelReason::Shutdown`.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        info!(queued = self.queue.len(), "Shutting down dispatcher");
        self.queue.close();

        let mut pool = self.pool.lock().await;
        let graceful = pool.join(drain_timeout).await;

        let abandoned = if graceful {
            self.registry.cancel_all(CancelReason::Shutdown)
        } else {
            let leftover = self.queue.drain();
            let queued = leftover
                .iter()
                .filter(|entry| self.registry.cancel(entry.request.id, CancelReason::Shutdown).is_ok())
                .count();
            let abandoned = queued + self.registry.cancel_all(CancelReason::Shutdown);
            let leftover = leftover.len();
            pool.abort();
            warn!(leftover, abandoned, "Drain timeout elapsed, abandoning remaining work");
            abandoned
        };

        self.janitor.abort();
        self.metrics.set_workers(0);
        info!(graceful, abandoned, "Dispatcher stopped");

        ShutdownReport { graceful, abandoned }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.queue.close();
        self.janitor.abort();
    }
}

fn spawn_janitor(
    registry: Arc<ResultRegistry>,
    period: Duration,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = registry.reap_terminal(grace);
            if reaped > 0 {
                debug!(reaped, "Reaped uncollected results");
            }
        }
    })
}
