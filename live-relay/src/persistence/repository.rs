//! Repository interface and the in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::{Consumer, Producer, Stream, TransitionRecord};
use crate::{Error, Result};

/// Storage for streams, producers, consumers and the transition log.
///
/// Writes are upserts so a write replayed after a transient failure is
/// harmless. Appending a transition whose `(stream_id, seq)` already exists
/// is a no-op.
#[async_trait]
pub trait StreamRepository: Send + Sync {
    async fn upsert_stream(&self, stream: &Stream) -> Result<()>;
    async fn upsert_producer(&self, producer: &Producer) -> Result<()>;
    async fn upsert_consumer(&self, consumer: &Consumer) -> Result<()>;
    async fn append_transition(&self, record: &TransitionRecord) -> Result<()>;
    async fn list_transitions(&self, stream_id: &str) -> Result<Vec<TransitionRecord>>;
    async fn get_stream(&self, stream_id: &str) -> Result<Option<Stream>>;
}

#[derive(Default)]
struct Tables {
    streams: HashMap<String, Stream>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
    transitions: HashMap<String, Vec<TransitionRecord>>,
}

/// Repository kept in process memory.
///
/// Can be told to fail the next N writes, which lets callers exercise their
/// retry paths.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
    failures: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a persistence error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn producer(&self, producer_id: &str) -> Option<Producer> {
        self.tables.read().producers.get(producer_id).cloned()
    }

    pub fn producers_for(&self, stream_id: &str) -> Vec<Producer> {
        let mut producers: Vec<_> = self
            .tables
            .read()
            .producers
            .values()
            .filter(|p| p.stream_id == stream_id)
            .cloned()
            .collect();
        producers.sort_by_key(|p| p.created_at);
        producers
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<Consumer> {
        self.tables.read().consumers.get(consumer_id).cloned()
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Persistence("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamRepository for MemoryRepository {
    async fn upsert_stream(&self, stream: &Stream) -> Result<()> {
        self.check_available()?;
        self.tables
            .write()
            .streams
            .insert(stream.id.clone(), stream.clone());
        Ok(())
    }

    async fn upsert_producer(&self, producer: &Producer) -> Result<()> {
        self.check_available()?;
        self.tables
            .write()
            .producers
            .insert(producer.id.clone(), producer.clone());
        Ok(())
    }

    async fn upsert_consumer(&self, consumer: &Consumer) -> Result<()> {
        self.check_available()?;
        self.tables
            .write()
            .consumers
            .insert(consumer.id.clone(), consumer.clone());
        Ok(())
    }

    async fn append_transition(&self, record: &TransitionRecord) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let log = tables.transitions.entry(record.stream_id.clone()).or_default();
        if !log.iter().any(|r| r.seq == record.seq) {
            log.push(record.clone());
            log.sort_by_key(|r| r.seq);
        }
        Ok(())
    }

    async fn list_transitions(&self, stream_id: &str) -> Result<Vec<TransitionRecord>> {
        Ok(self
            .tables
            .read()
            .transitions
            .get(stream_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Option<Stream>> {
        Ok(self.tables.read().streams.get(stream_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReasonCode, SourceDescriptor, StreamState};

    #[tokio::test]
    async fn test_append_is_idempotent_per_seq() {
        let repo = MemoryRepository::new();
        let (mut stream, created) =
            Stream::create("cam", SourceDescriptor::parse("rtsp://cam1").unwrap());
        let ready = stream
            .apply(StreamState::Ready, ReasonCode::SourceIdentified, None, 1)
            .unwrap();

        repo.append_transition(&ready).await.unwrap();
        repo.append_transition(&created).await.unwrap();
        repo.append_transition(&ready).await.unwrap();

        let log = repo.list_transitions(&stream.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[1].to_state, StreamState::Ready);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let repo = MemoryRepository::new();
        let (stream, _) = Stream::create("cam", SourceDescriptor::parse("rtsp://cam1").unwrap());

        repo.fail_next_writes(2);
        assert!(repo.upsert_stream(&stream).await.is_err());
        assert!(repo.upsert_stream(&stream).await.is_err());
        repo.upsert_stream(&stream).await.unwrap();

        assert_eq!(repo.get_stream(&stream.id).await.unwrap(), Some(stream));
    }
}
