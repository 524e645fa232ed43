//! Viewer session tracking.

mod registry;

pub use registry::{ConsumerSessionRegistry, ConsumerStats, SessionCloser};
