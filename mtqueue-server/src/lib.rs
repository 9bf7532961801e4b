//! mtqueue Server Library
//!
//! HTTP translation service in front of the mtqueue dispatcher.
//!
//! This library provides the router, backends and startup logic so the
//! service can run as the `mtqueue` binary or be embedded in tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use clap::ValueEnum;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use mtqueue_core::{DispatchConfig, Dispatcher};

pub mod backend;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;

#[cfg(test)]
mod test_support;

pub use error::ApiError;
pub use state::AppState;

/// Which translation backend to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BackendKind {
    /// Tag the input with the target language (no model needed)
    #[default]
    Echo,
    /// Forward to an upstream model server
    Http,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Translation backend
    pub backend: BackendKind,
    /// Upstream model server URL (http backend)
    pub backend_url: String,
    /// Default source language
    pub source_lang: String,
    /// Default target language
    pub target_lang: String,
    /// HTTP timeout for upstream calls
    pub upstream_timeout: Duration,
    /// Simulated latency of the echo backend
    pub echo_delay: Duration,
    /// How long shutdown waits for queued work
    pub drain_timeout: Duration,
    /// Queueing and worker settings
    pub dispatch: DispatchConfig,
    /// Whether to print the banner on startup
    pub print_banner: bool,
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            backend: BackendKind::Echo,
            backend_url: "http://localhost:5000".to_string(),
            source_lang: "en".to_string(),
            target_lang: "fr".to_string(),
            upstream_timeout: Duration::from_secs(60),
            echo_delay: Duration::ZERO,
            drain_timeout: Duration::from_secs(30),
            dispatch: DispatchConfig::default(),
            print_banner: true,
            verbose: false,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("MTQUEUE_HOST").unwrap_or(defaults.host),
            port: std::env::var("MTQUEUE_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            backend: std::env::var("MTQUEUE_BACKEND")
                .ok()
                .and_then(|s| BackendKind::from_str(&s, true).ok())
                .unwrap_or(defaults.backend),
            backend_url: std::env::var("MTQUEUE_BACKEND_URL").unwrap_or(defaults.backend_url),
            source_lang: std::env::var("MTQUEUE_SOURCE_LANG").unwrap_or(defaults.source_lang),
            target_lang: std::env::var("MTQUEUE_TARGET_LANG").unwrap_or(defaults.target_lang),
            upstream_timeout: std::env::var("MTQUEUE_UPSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            echo_delay: std::env::var("MTQUEUE_ECHO_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.echo_delay),
            drain_timeout: std::env::var("MTQUEUE_DRAIN_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
            dispatch: DispatchConfig::from_env(),
            print_banner: defaults.print_banner,
            verbose: std::env::var("MTQUEUE_VERBOSE")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
        }
    }
}

/// Build the backend and dispatcher and register the HTTP metrics.
///
/// Must be called from within a tokio runtime.
pub fn build_state(config: ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let engine = backend::build_backend(&config).context("failed to create translation backend")?;
    let dispatcher = Dispatcher::start(config.dispatch.clone(), engine)
        .context("invalid dispatcher configuration")?;

    let http_metrics = metrics::HttpMetrics::new();
    if let Err(e) = http_metrics.register(dispatcher.metrics().registry()) {
        warn!("Failed to register HTTP metrics: {}", e);
    }

    Ok(Arc::new(AppState::new(config, dispatcher, http_metrics)))
}

/// Build the router with every endpoint and the middleware stack
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/live", get(routes::live))
        .route("/metrics", get(routes::metrics))
        .route("/stats", get(routes::stats))
        // Translation
        .route("/translate", post(routes::translate))
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the mtqueue server.
///
/// Starts the HTTP server and blocks until Ctrl-C, then stops accepting
/// connections and drains the dispatcher.
///
/// # Example
/// ```no_run
/// use mtqueue_server::{run_server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ServerConfig { port: 8000, ..Default::default() };
///     run_server(config).await
/// }
/// ```
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        port = config.port,
        backend = ?config.backend,
        workers = config.dispatch.workers,
        "Starting mtqueue v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = build_state(config.clone())?;

    // Check backend connectivity
    match state.check_backend().await {
        Ok(_) => info!(backend = state.dispatcher.engine().name(), "Translation backend ready"),
        Err(e) => {
            warn!(
                "Translation backend not ready: {}. \
                 Server will start anyway and retry on requests.",
                e
            );
        }
    }

    let app = build_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("mtqueue listening on http://{}", addr);
    info!("Translate: http://{}/translate", addr);
    info!("Health:    http://{}/health", addr);

    if config.print_banner {
        print_banner(&config);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let report = state.dispatcher.shutdown(config.drain_timeout).await;
    info!(graceful = report.graceful, abandoned = report.abandoned, "Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining");
}

/// Print the startup banner
fn print_banner(config: &ServerConfig) {
    let addr = format!("{}:{}", config.host, config.port);
    let dispatch = &config.dispatch;

    println!();
    println!("==================================================");
    println!("  mtqueue v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://{}", addr);
    match config.backend {
        BackendKind::Echo => println!("  Backend: echo (delay {:?})", config.echo_delay),
        BackendKind::Http => println!("  Backend: http ({})", config.backend_url),
    }
    println!("  Languages: {} -> {}", config.source_lang, config.target_lang);
    println!();
    println!("  Dispatch configuration:");
    println!("    Workers: {}", dispatch.workers);
    println!(
        "    Queue: {} shared, reserved P0 {} / P1 {} / P2 {} / P3 {}",
        dispatch.shared_capacity,
        dispatch.reserved[0],
        dispatch.reserved[1],
        dispatch.reserved[2],
        dispatch.reserved[3]
    );
    println!("    Inference timeout: {}s", dispatch.inference_timeout.as_secs());
    match dispatch.admission_wait {
        Some(wait) => println!("    Admission wait: {}ms", wait.as_millis()),
        None => println!("    Admission wait: none (reject when full)"),
    }
    println!();
    println!("  Endpoints:");
    println!("    Translate: POST /translate");
    println!("    Health:    GET  /health, /ready, /live");
    println!("    Metrics:   GET  /metrics, /stats");
    println!("==================================================");
    println!();
}
