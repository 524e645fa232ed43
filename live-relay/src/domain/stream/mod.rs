//! Stream aggregate.

mod entity;
mod state;

pub use entity::Stream;
pub use state::StreamState;
