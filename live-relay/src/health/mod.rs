//! Stream health monitoring.

mod monitor;
mod snapshot;

pub use monitor::HealthMonitor;
pub use snapshot::{AggregateHealth, HealthStatus, StreamHealth};
