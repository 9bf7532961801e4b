//! HTTP route handlers for the mtqueue service.
//!
//! - `health`: health, readiness, metrics and stats endpoints
//! - `translate`: the prioritised translation endpoint

pub mod health;
pub mod translate;

pub use health::{health, live, metrics, ready, stats};
pub use translate::translate;
