//! mtqueue Core Library
//!
//! Priority-aware request dispatch for a translation backend whose
//! inference is slow and capacity-limited.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              submit(payload, tier, deadline)             │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │   Admission     │ ← shared pool + per-tier reserves
//!                    └────────┬────────┘
//!                             │ ResultHandle ◀── ResultRegistry
//!                    ┌────────▼────────┐
//!                    │ PriorityQueue   │ ← P0 first, FIFO within a tier
//!                    │  P0 │ P1 │ P2 │ P3
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │  WorkerPool     │ ← supervised, restarted on panic
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │ InferenceEngine │ ← backend, with timeout
//!                    └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mtqueue_core::{DispatchConfig, Dispatcher, InferenceEngine, Payload, PriorityTier};
//!
//! # async fn run(engine: Arc<dyn InferenceEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::start(DispatchConfig::default(), engine)?;
//! let handle = dispatcher.submit(Payload::new("Hello"), PriorityTier::P1, None).await?;
//! let translation = handle.wait().await?;
//! println!("{}", translation.text);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod request;
pub mod tier;
pub mod worker;

pub use admission::{AdmissionPolicy, Rejection, RejectionReason};
pub use config::DispatchConfig;
pub use dispatcher::{Dispatcher, ShutdownReport};
pub use engine::{EngineError, InferenceEngine};
pub use error::{CancelReason, ConfigError, FailureKind, RequestError};
pub use metrics::{MetricsRegistry, MetricsSnapshot, TierSnapshot};
pub use registry::{HandleState, Outcome, ResultHandle, Translation};
pub use request::{Payload, RequestId};
pub use tier::{PriorityTier, TierError};
