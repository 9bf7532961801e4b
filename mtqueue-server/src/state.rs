//! Application state for the mtqueue HTTP service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::warn;

use mtqueue_core::{Dispatcher, EngineError};

use crate::metrics::HttpMetrics;
use crate::ServerConfig;

/// Application state shared across all handlers
pub struct AppState {
    /// Priority dispatcher in front of the backend
    pub dispatcher: Dispatcher,

    /// Configuration
    pub config: ServerConfig,

    /// Process start, for uptime reporting
    pub started_at: Instant,

    /// End-to-end metrics for this instance's `/translate` calls
    pub http_metrics: HttpMetrics,

    /// Result of the last backend health check
    model_loaded: AtomicBool,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ServerConfig, dispatcher: Dispatcher, http_metrics: HttpMetrics) -> Self {
        Self {
            dispatcher,
            config,
            started_at: Instant::now(),
            http_metrics,
            model_loaded: AtomicBool::new(false),
        }
    }

    pub fn model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::Relaxed)
    }

    /// Probe the backend and remember the answer
    pub async fn check_backend(&self) -> Result<(), EngineError> {
        let result = self.dispatcher.engine().health_check().await;
        let loaded = result.is_ok();
        if self.model_loaded.swap(loaded, Ordering::Relaxed) && !loaded {
            warn!(backend = self.dispatcher.engine().name(), "Backend became unavailable");
        }
        result
    }

    /// Whether the backend can take work, probing it again if it was down
    pub async fn ensure_backend(&self) -> bool {
        self.model_loaded() || self.check_backend().await.is_ok()
    }
}
