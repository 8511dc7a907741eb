//! Logging, request correlation, and in-process metrics for greenroom.

pub mod logging;
pub mod metrics;
pub mod middleware;

pub use metrics::MetricsCollector;
