//! Domain entities and value objects.

pub mod consumer;
pub mod producer;
pub mod source;
pub mod stream;
pub mod transition;

pub use consumer::{Consumer, ConsumerState};
pub use producer::{Producer, ProducerState};
pub use source::{SourceDescriptor, Ssrc};
pub use stream::{Stream, StreamState};
pub use transition::{ReasonCode, TransitionRecord};
