//! Metrics collection and Prometheus export.
//!
//! The health sweep feeds the collector; `GET /metrics` renders it in the
//! Prometheus text format.

mod collector;
mod prometheus;

pub use collector::{MetricsCollector, MetricsSnapshot, StreamGauges};
pub use prometheus::PrometheusExporter;
