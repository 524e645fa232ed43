//! Durable record of streams, producers, consumers and transitions.

pub mod models;
mod repository;
pub mod retry;
mod sqlite;
mod writer;

pub use repository::{MemoryRepository, StreamRepository};
pub use retry::RetryPolicy;
pub use sqlite::{SqliteRepository, init_pool};
pub use writer::{PersistenceWriter, WriteOp};
