//! Prometheus metrics for the dispatch engine.
//!
//! Every dispatcher owns its own [`MetricsRegistry`] (and the underlying
//! `prometheus::Registry`), so several engines can live in one process and
//! tests never share counters. Each counter is bumped by exactly one
//! component action:
//!
//! | Metric | Updated by |
//! |--------|------------|
//! | `requests_admitted_total` | queue insert (under the queue lock) |
//! | `requests_rejected_total` | admission controller |
//! | `requests_completed_total` / `requests_failed_total` / `requests_cancelled_total` | result registry terminal transition |
//! | `requests_discarded_total` | worker skipping a cancelled or expired entry |
//! | `queue_wait_seconds` | queue pop |
//! | `processing_seconds` | worker after the backend call |

use std::time::Duration;

use prometheus::core::Metric;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use serde::Serialize;

use crate::tier::PriorityTier;

const NAMESPACE: &str = "mtqueue";

/// Label values for `requests_rejected_total{reason}`
pub const REJECTION_REASONS: [&str; 3] = ["global_capacity", "tier_capacity", "shutting_down"];

/// Label values for `requests_failed_total{kind}`
pub const FAILURE_KINDS: [&str; 3] = ["inference_error", "timeout", "internal"];

/// Label values for `requests_cancelled_total{reason}`
pub const CANCEL_REASONS: [&str; 4] = ["deadline", "explicit", "caller_gone", "shutdown"];

const WAIT_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

const PROCESSING_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Metrics shared by the queue, admission controller, registry and workers
pub struct MetricsRegistry {
    registry: Registry,

    admitted: IntCounterVec,
    rejected: IntCounterVec,
    completed: IntCounterVec,
    failed: IntCounterVec,
    cancelled: IntCounterVec,
    discarded: IntCounterVec,

    queue_depth: IntGaugeVec,
    active_workers: IntGauge,
    workers: IntGauge,
    worker_restarts: IntCounter,

    queue_wait: HistogramVec,
    processing: HistogramVec,
}

impl MetricsRegistry {
    /// Create the metric families and register them with a fresh registry
    pub fn new() -> Self {
        let registry = Registry::new();

        let admitted = counter_vec(
            "requests_admitted_total",
            "Requests accepted into the queue",
            &["priority"],
        );
        let rejected = counter_vec(
            "requests_rejected_total",
            "Requests refused at admission",
            &["priority", "reason"],
        );
        let completed = counter_vec(
            "requests_completed_total",
            "Requests translated successfully",
            &["priority"],
        );
        let failed = counter_vec(
            "requests_failed_total",
            "Requests that failed during inference",
            &["priority", "kind"],
        );
        let cancelled = counter_vec(
            "requests_cancelled_total",
            "Requests cancelled before a result was delivered",
            &["priority", "reason"],
        );
        let discarded = counter_vec(
            "requests_discarded_total",
            "Dequeued entries skipped without calling the backend",
            &["priority"],
        );

        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Requests currently waiting in the queue")
                .namespace(NAMESPACE),
            &["priority"],
        )
        .expect("metric can be created");

        let active_workers = IntGauge::with_opts(
            Opts::new("active_workers", "Workers currently running inference").namespace(NAMESPACE),
        )
        .expect("metric can be created");

        let workers = IntGauge::with_opts(
            Opts::new("workers", "Size of the worker pool").namespace(NAMESPACE),
        )
        .expect("metric can be created");

        let worker_restarts = IntCounter::with_opts(
            Opts::new("worker_restarts_total", "Workers restarted after an internal fault")
                .namespace(NAMESPACE),
        )
        .expect("metric can be created");

        let queue_wait = histogram_vec(
            "queue_wait_seconds",
            "Time spent waiting in the queue before dispatch",
            WAIT_BUCKETS,
        );
        let processing = histogram_vec(
            "processing_seconds",
            "Time from dispatch to a terminal state",
            PROCESSING_BUCKETS,
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(admitted.clone()),
            Box::new(rejected.clone()),
            Box::new(completed.clone()),
            Box::new(failed.clone()),
            Box::new(cancelled.clone()),
            Box::new(discarded.clone()),
            Box::new(queue_depth.clone()),
            Box::new(active_workers.clone()),
            Box::new(workers.clone()),
            Box::new(worker_restarts.clone()),
            Box::new(queue_wait.clone()),
            Box::new(processing.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("metric names are unique");
        }

        let metrics = Self {
            registry,
            admitted,
            rejected,
            completed,
            failed,
            cancelled,
            discarded,
            queue_depth,
            active_workers,
            workers,
            worker_restarts,
            queue_wait,
            processing,
        };
        metrics.init_series();
        metrics
    }

    /// Touch every labelled series so scrapes show zeros instead of gaps
    fn init_series(&self) {
        for tier in PriorityTier::ALL {
            let p = tier.label();
            self.admitted.with_label_values(&[p]);
            self.completed.with_label_values(&[p]);
            self.discarded.with_label_values(&[p]);
            self.queue_depth.with_label_values(&[p]);
            self.queue_wait.with_label_values(&[p]);
            self.processing.with_label_values(&[p]);
            for reason in REJECTION_REASONS {
                self.rejected.with_label_values(&[p, reason]);
            }
            for kind in FAILURE_KINDS {
                self.failed.with_label_values(&[p, kind]);
            }
            for reason in CANCEL_REASONS {
                self.cancelled.with_label_values(&[p, reason]);
            }
        }
    }

    /// Underlying registry, for transports that add their own collectors
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admitted(&self, tier: PriorityTier) {
        self.admitted.with_label_values(&[tier.label()]).inc();
        self.queue_depth.with_label_values(&[tier.label()]).inc();
    }

    pub fn record_rejected(&self, tier: PriorityTier, reason: &str) {
        self.rejected.with_label_values(&[tier.label(), reason]).inc();
    }

    /// An entry left the queue towards a worker
    pub fn record_dequeued(&self, tier: PriorityTier, wait: Duration) {
        self.queue_depth.with_label_values(&[tier.label()]).dec();
        self.queue_wait
            .with_label_values(&[tier.label()])
            .observe(wait.as_secs_f64());
    }

    /// An entry left the queue without being dispatched (forced drain)
    pub fn record_removed(&self, tier: PriorityTier) {
        self.queue_depth.with_label_values(&[tier.label()]).dec();
    }

    pub fn record_completed(&self, tier: PriorityTier) {
        self.completed.with_label_values(&[tier.label()]).inc();
    }

    pub fn record_failed(&self, tier: PriorityTier, kind: &str) {
        self.failed.with_label_values(&[tier.label(), kind]).inc();
    }

    pub fn record_cancelled(&self, tier: PriorityTier, reason: &str) {
        self.cancelled.with_label_values(&[tier.label(), reason]).inc();
    }

    pub fn record_discarded(&self, tier: PriorityTier) {
        self.discarded.with_label_values(&[tier.label()]).inc();
    }

    pub fn record_processing(&self, tier: PriorityTier, elapsed: Duration) {
        self.processing
            .with_label_values(&[tier.label()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn worker_busy(&self) {
        self.active_workers.inc();
    }

    pub fn worker_idle(&self) {
        self.active_workers.dec();
    }

    pub fn set_workers(&self, n: usize) {
        self.workers.set(n as i64);
    }

    pub fn record_worker_restart(&self) {
        self.worker_restarts.inc();
    }

    pub fn queue_depth(&self, tier: PriorityTier) -> u64 {
        self.queue_depth.with_label_values(&[tier.label()]).get().max(0) as u64
    }

    pub fn active_workers(&self) -> u64 {
        self.active_workers.get().max(0) as u64
    }

    /// Point-in-time view of every metric. Reads atomics only.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tiers: Vec<TierSnapshot> = PriorityTier::ALL
            .iter()
            .map(|&tier| self.tier_snapshot(tier))
            .collect();

        MetricsSnapshot {
            queue_depth: tiers.iter().map(|t| t.queue_depth).sum(),
            active_workers: self.active_workers(),
            workers: self.workers.get().max(0) as u64,
            worker_restarts: self.worker_restarts.get(),
            tiers,
        }
    }

    fn tier_snapshot(&self, tier: PriorityTier) -> TierSnapshot {
        let p = tier.label();
        let sum_over = |vec: &IntCounterVec, labels: &[&str]| -> u64 {
            labels.iter().map(|l| vec.with_label_values(&[p, *l]).get()).sum()
        };

        TierSnapshot {
            priority: tier,
            admitted: self.admitted.with_label_values(&[p]).get(),
            rejected: sum_over(&self.rejected, &REJECTION_REASONS),
            completed: self.completed.with_label_values(&[p]).get(),
            failed: sum_over(&self.failed, &FAILURE_KINDS),
            timed_out: self.failed.with_label_values(&[p, "timeout"]).get(),
            cancelled: sum_over(&self.cancelled, &CANCEL_REASONS),
            discarded: self.discarded.with_label_values(&[p]).get(),
            queue_depth: self.queue_depth(tier),
            wait_time: DistributionSnapshot::from_histogram(&self.queue_wait.with_label_values(&[p])),
            processing_time: DistributionSnapshot::from_histogram(
                &self.processing.with_label_values(&[p]),
            ),
        }
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .expect("metric can be created")
}

fn histogram_vec(name: &str, help: &str, buckets: &[f64]) -> HistogramVec {
    HistogramVec::new(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .buckets(buckets.to_vec()),
        &["priority"],
    )
    .expect("metric can be created")
}

/// Snapshot of every metric at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tiers: Vec<TierSnapshot>,
    pub queue_depth: u64,
    pub active_workers: u64,
    pub workers: u64,
    pub worker_restarts: u64,
}

impl MetricsSnapshot {
    pub fn tier(&self, tier: PriorityTier) -> &TierSnapshot {
        &self.tiers[tier.index()]
    }

    pub fn total_admitted(&self) -> u64 {
        self.tiers.iter().map(|t| t.admitted).sum()
    }

    pub fn total_rejected(&self) -> u64 {
        self.tiers.iter().map(|t| t.rejected).sum()
    }
}

/// Per-tier counters, gauges and latency distributions
#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshot {
    pub priority: PriorityTier,
    pub admitted: u64,
    pub rejected: u64,
    pub completed: u64,
    /// Backend errors, timeouts and internal faults
    pub failed: u64,
    /// Subset of `failed`
    pub timed_out: u64,
    pub cancelled: u64,
    pub discarded: u64,
    pub queue_depth: u64,
    pub wait_time: DistributionSnapshot,
    pub processing_time: DistributionSnapshot,
}

impl TierSnapshot {
    /// Requests that reached a terminal state
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

/// Histogram contents in seconds
#[derive(Debug, Clone, Serialize)]
pub struct DistributionSnapshot {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub buckets: Vec<BucketSnapshot>,
}

/// Cumulative count of observations `<= le`
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub le: f64,
    pub count: u64,
}

impl DistributionSnapshot {
    fn from_histogram(histogram: &Histogram) -> Self {
        let proto = histogram.metric();
        let h = proto.get_histogram();
        let count = h.get_sample_count();
        let sum = h.get_sample_sum();

        Self {
            count,
            sum,
            mean: if count == 0 { 0.0 } else { sum / count as f64 },
            buckets: h
                .get_bucket()
                .iter()
                .map(|b| BucketSnapshot { le: b.get_upper_bound(), count: b.get_cumulative_count() })
                .collect(),
        }
    }
}
