//! Metrics module for the mtqueue HTTP service
//!
//! The dispatcher owns the queue metrics; this module adds the
//! end-to-end request metrics seen at the HTTP boundary.

pub mod prometheus;

pub use self::prometheus::HttpMetrics;
