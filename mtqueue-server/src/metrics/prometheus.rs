//! Prometheus metrics for the HTTP boundary
//!
//! Each server instance owns its own collectors and registers them into
//! its dispatcher's registry, so two services in one process never mix
//! their series.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use mtqueue_core::PriorityTier;

const LATENCY_BUCKETS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// End-to-end `/translate` metrics
#[derive(Clone)]
pub struct HttpMetrics {
    /// End-to-end latency of `/translate`, admission to response
    request_latency_seconds: HistogramVec,
    /// `/translate` responses by priority and HTTP status
    responses_total: IntCounterVec,
}

impl HttpMetrics {
    pub fn new() -> Self {
        Self {
            request_latency_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "request_latency_seconds",
                    "End-to-end translation request latency in seconds",
                )
                .namespace("mtqueue")
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["priority"],
            )
            .expect("metric can be created"),
            responses_total: IntCounterVec::new(
                Opts::new("http_responses_total", "Translation responses by status code")
                    .namespace("mtqueue"),
                &["priority", "status"],
            )
            .expect("metric can be created"),
        }
    }

    /// Register the HTTP metrics with a dispatcher's registry
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.request_latency_seconds.clone()))?;
        registry.register(Box::new(self.responses_total.clone()))?;
        Ok(())
    }

    /// Record one finished `/translate` call
    pub fn observe_response(&self, tier: PriorityTier, status: u16, elapsed: Duration) {
        self.request_latency_seconds
            .with_label_values(&[tier.label()])
            .observe(elapsed.as_secs_f64());
        self.responses_total
            .with_label_values(&[tier.label(), &status.to_string()])
            .inc();
    }

    pub fn responses(&self, tier: PriorityTier, status: u16) -> u64 {
        self.responses_total
            .with_label_values(&[tier.label(), &status.to_string()])
            .get()
    }
}

impl Default for HttpMetrics {
    fn default() -> Self {
        Self::new()
    }
}
