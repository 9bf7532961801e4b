//! mtqueue - priority-aware translation service.
//!
//! Accepts translation requests at four priority tiers, queues them with
//! reserved capacity for urgent traffic and dispatches them to a backend
//! through a fixed pool of workers.
//!
//! ## Quick Start
//!
//! ```bash
//! # Development backend, defaults (port 8000, 4 workers)
//! mtqueue
//!
//! # Forward to a model server
//! MTQUEUE_BACKEND_URL=http://10.0.0.5:5000 mtqueue --backend http --workers 2
//!
//! curl -X POST localhost:8000/translate -H 'content-type: application/json' \
//!      -d '{"text": "Hello world", "priority": 0}'
//! ```

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mtqueue_server::{run_server, BackendKind, ServerConfig};

#[derive(Parser)]
#[command(name = "mtqueue")]
#[command(version)]
#[command(about = "Priority-aware translation service", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Translation backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// Upstream model server URL (http backend)
    #[arg(long)]
    backend_url: Option<String>,

    /// Number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Queue slots shared by all priorities
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Backend timeout in seconds
    #[arg(long)]
    inference_timeout: Option<u64>,

    /// Source language
    #[arg(long)]
    source_lang: Option<String>,

    /// Target language
    #[arg(long)]
    target_lang: Option<String>,

    /// Simulated echo backend latency in milliseconds
    #[arg(long)]
    echo_delay_ms: Option<u64>,

    /// Don't print the startup banner
    #[arg(long)]
    no_banner: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the environment
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(url) = self.backend_url {
            config.backend_url = url;
        }
        if let Some(workers) = self.workers {
            config.dispatch.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.dispatch.shared_capacity = capacity;
        }
        if let Some(secs) = self.inference_timeout {
            config.dispatch.inference_timeout = Duration::from_secs(secs);
        }
        if let Some(lang) = self.source_lang {
            config.source_lang = lang;
        }
        if let Some(lang) = self.target_lang {
            config.target_lang = lang;
        }
        if let Some(ms) = self.echo_delay_ms {
            config.echo_delay = Duration::from_millis(ms);
        }
        config.print_banner = !self.no_banner;
        config.verbose |= self.verbose;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.apply(ServerConfig::from_env());

    // Initialize logging
    let default_filter = if config.verbose {
        "mtqueue_server=debug,mtqueue_core=debug,tower_http=debug"
    } else {
        "mtqueue_server=info,mtqueue_core=info,tower_http=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    run_server(config).await
}
