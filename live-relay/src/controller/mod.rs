//! Stream lifecycle control.
//!
//! Each stream is owned by one actor task with a bounded mailbox. The
//! controller routes requests to actors and answers reads from their shared
//! views.

mod actor;
mod messages;
mod service;

pub use actor::StreamView;
pub use messages::{CreateOutcome, StreamCommand};
pub use service::StreamController;
