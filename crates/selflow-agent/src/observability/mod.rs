//! Observability for the capture pipeline
//!
//! In-process metrics only; the coordinator exposes them through its stats
//! snapshot and the throughput log line.

mod metrics;

pub use metrics::*;
