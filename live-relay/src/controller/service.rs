//! Stream controller: the only component that mutates stream state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::actor::{Services, StreamActor, StreamView};
use super::messages::{CreateOutcome, StreamCommand};
use crate::config::{ControllerConfig, StreamPolicy};
use crate::consumer::{ConsumerSessionRegistry, ConsumerStats};
use crate::domain::consumer::close_reason;
use crate::domain::{
    Consumer, Producer, ReasonCode, SourceDescriptor, Ssrc, Stream, StreamState, TransitionRecord,
};
use crate::ingest::{IngestPolicy, IngestionSupervisor};
use crate::persistence::{PersistenceWriter, StreamRepository};
use crate::router::{AttachedConsumer, RouterGateway};
use crate::{Error, Result};

struct StreamEntry {
    mailbox: mpsc::Sender<StreamCommand>,
    view: Arc<StreamView>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct StreamController {
    config: ControllerConfig,
    services: Arc<Services>,
    registry: Arc<ConsumerSessionRegistry>,
    repository: Arc<dyn StreamRepository>,
    streams: DashMap<String, Arc<StreamEntry>>,
    shutting_down: AtomicBool,
}

impl StreamController {
    pub fn new(
        config: ControllerConfig,
        supervisor: Arc<IngestionSupervisor>,
        gateway: Arc<RouterGateway>,
        registry: Arc<ConsumerSessionRegistry>,
        writer: Arc<PersistenceWriter>,
        repository: Arc<dyn StreamRepository>,
    ) -> Self {
        Self {
            config,
            services: Arc::new(Services {
                supervisor,
                gateway,
                writer,
                by_source: DashMap::new(),
            }),
            registry,
            repository,
            streams: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn supervisor(&self) -> &Arc<IngestionSupervisor> {
        &self.services.supervisor
    }

    pub fn registry(&self) -> &Arc<ConsumerSessionRegistry> {
        &self.registry
    }

    /// Create a stream for `source`, or return the active stream already
    /// using it.
    pub fn create(
        &self,
        source: &str,
        name: Option<&str>,
        policy: StreamPolicy,
    ) -> Result<CreateOutcome> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let source = SourceDescriptor::parse(source)?;
        policy.validate()?;

        match self.services.by_source.entry(source.key().to_string()) {
            Entry::Occupied(existing) => {
                let view = self
                    .streams
                    .get(existing.get())
                    .map(|e| e.view.clone())
                    .ok_or_else(|| Error::Other("source index out of sync".into()))?;
                debug!(stream_id = %existing.get(), source = %source.redacted(), "Reusing active stream");
                Ok(CreateOutcome {
                    stream: view.snapshot(),
                    reused: true,
                })
            }
            Entry::Vacant(slot) => {
                let name = name
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| source.redacted());
                let (stream, created) = Stream::create(name, source);
                let stream_id = stream.id.clone();

                self.services.writer.stream(&stream);
                self.services.writer.transition(&created);

                let view = Arc::new(StreamView::new(stream.clone(), created));
                let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
                let policy = IngestPolicy::resolve(self.services.supervisor.config(), &policy);
                let actor = StreamActor::new(view.clone(), self.services.clone(), policy, rx);

                let entry = Arc::new(StreamEntry {
                    mailbox: tx,
                    view,
                    task: Mutex::new(None),
                });
                self.streams.insert(stream_id.clone(), entry.clone());
                slot.insert(stream_id.clone());
                *entry.task.lock() = Some(tokio::spawn(actor.run()));

                info!(stream_id = %stream_id, source = %stream.source.redacted(), "Stream created");
                Ok(CreateOutcome {
                    stream,
                    reused: false,
                })
            }
        }
    }

    pub async fn get(&self, stream_id: &str) -> Result<Stream> {
        if let Some(entry) = self.streams.get(stream_id) {
            return Ok(entry.view.snapshot());
        }
        self.repository
            .get_stream(stream_id)
            .await?
            .ok_or_else(|| Error::not_found("Stream", stream_id))
    }

    /// Streams held in memory, oldest first. Closed streams drop out after
    /// the retention period.
    pub fn list(&self, state: Option<StreamState>) -> Vec<Stream> {
        let mut streams: Vec<Stream> = self
            .streams
            .iter()
            .map(|e| e.view.snapshot())
            .filter(|s| state.is_none_or(|wanted| s.state == wanted))
            .collect();
        streams.sort_by_key(|s| s.created_at);
        streams
    }

    pub async fn transitions(&self, stream_id: &str) -> Result<Vec<TransitionRecord>> {
        if let Some(entry) = self.streams.get(stream_id) {
            return Ok(entry.view.transitions());
        }
        let records = self.repository.list_transitions(stream_id).await?;
        if records.is_empty() {
            return Err(Error::not_found("Stream", stream_id));
        }
        Ok(records)
    }

    /// In-memory view of a stream owned by this process.
    pub fn snapshot(&self, stream_id: &str) -> Option<Stream> {
        Some(self.streams.get(stream_id)?.view.snapshot())
    }

    pub fn producer(&self, stream_id: &str) -> Option<Producer> {
        self.streams.get(stream_id)?.view.producer()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn advance_to_ready(&self, stream_id: &str, ssrc: Ssrc) -> Result<Stream> {
        self.request(stream_id, |reply| StreamCommand::AdvanceToReady { ssrc, reply })
            .await
    }

    /// Tear a stream down. Stopping a stopped stream succeeds.
    pub async fn stop(&self, stream_id: &str) -> Result<Stream> {
        if !self.streams.contains_key(stream_id) {
            // Only closed streams leave memory.
            return self.get(stream_id).await;
        }
        self.request(stream_id, |reply| StreamCommand::Stop {
            reason: ReasonCode::StopRequested,
            reply,
        })
        .await
    }

    /// Retry a stream that was left in `Error` without ingestion.
    pub async fn reconnect(&self, stream_id: &str) -> Result<Stream> {
        let stream = self.get(stream_id).await?;
        if stream.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: stream.state.to_string(),
                to: StreamState::Ready.to_string(),
            });
        }
        self.request(stream_id, |reply| StreamCommand::Reconnect { reply })
            .await
    }

    pub async fn fault(
        &self,
        stream_id: &str,
        reason: ReasonCode,
        detail: Option<String>,
    ) -> Result<Stream> {
        self.request(stream_id, |reply| StreamCommand::Fault {
            reason,
            detail,
            reply,
        })
        .await
    }

    async fn request(
        &self,
        stream_id: &str,
        command: impl FnOnce(oneshot::Sender<Result<Stream>>) -> StreamCommand,
    ) -> Result<Stream> {
        let entry = self
            .streams
            .get(stream_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("Stream", stream_id))?;

        let (tx, rx) = oneshot::channel();
        if entry.mailbox.send(command(tx)).await.is_err() {
            // The actor has finished; the stream is terminal.
            return Ok(entry.view.snapshot());
        }
        match tokio::time::timeout(self.config.reply_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Ok(entry.view.snapshot()),
            Err(_) => Err(Error::timeout("stream command", self.config.reply_timeout())),
        }
    }

    /// Attach a viewer to a live stream.
    pub async fn attach_consumer(
        &self,
        stream_id: &str,
        client_tag: &str,
        capabilities: Value,
    ) -> Result<AttachedConsumer> {
        let view = self
            .streams
            .get(stream_id)
            .map(|e| e.view.clone())
            .ok_or_else(|| Error::not_found("Stream", stream_id))?;

        let state = view.state();
        let producer = match view.producer() {
            Some(producer) if state == StreamState::Live && producer.is_active() => producer,
            _ => {
                return Err(Error::StreamNotLive {
                    stream_id: stream_id.to_string(),
                    state: state.to_string(),
                });
            }
        };

        let attached = self
            .services
            .gateway
            .attach_consumer(stream_id, &producer.id, client_tag, capabilities)
            .await?;
        self.services.writer.consumer(&attached.consumer);
        Ok(attached)
    }

    pub async fn complete_handshake(&self, consumer_id: &str, handshake: &Value) -> Result<Consumer> {
        let consumer = self
            .services
            .gateway
            .complete_handshake(consumer_id, handshake)
            .await?;
        self.services.writer.consumer(&consumer);
        Ok(consumer)
    }

    pub fn heartbeat(&self, consumer_id: &str) -> Result<Consumer> {
        self.registry.record_heartbeat(consumer_id)
    }

    /// Detach a viewer. Detaching an unknown or closed consumer succeeds.
    pub async fn detach_consumer(&self, consumer_id: &str) -> Option<Consumer> {
        let consumer = self
            .services
            .gateway
            .detach_consumer(consumer_id, close_reason::DETACHED)
            .await?;
        self.services.writer.consumer(&consumer);
        Some(consumer)
    }

    /// Force a viewer off its stream. Unknown consumers are an error.
    pub async fn evict_consumer(&self, consumer_id: &str) -> Result<Consumer> {
        let consumer = self
            .services
            .gateway
            .evict_consumer(consumer_id, close_reason::EVICTED)
            .await?;
        self.services.writer.consumer(&consumer);
        Ok(consumer)
    }

    pub fn list_consumers(&self, stream_id: &str) -> Result<Vec<Consumer>> {
        if !self.streams.contains_key(stream_id) {
            return Err(Error::not_found("Stream", stream_id));
        }
        Ok(self.registry.list(stream_id))
    }

    pub fn consumer_stats(&self, stream_id: &str) -> Result<ConsumerStats> {
        if !self.streams.contains_key(stream_id) {
            return Err(Error::not_found("Stream", stream_id));
        }
        Ok(self.registry.stats(stream_id))
    }

    /// Drop streams closed for longer than the retention period, once every
    /// queued record has been stored. Returns the dropped ids.
    pub async fn evict_closed(&self) -> Vec<String> {
        let retention = self.config.closed_retention();
        let expired: Vec<String> = self
            .streams
            .iter()
            .filter(|e| {
                e.view.closed_for().is_some_and(|d| d >= retention)
                    && e.task.lock().as_ref().is_none_or(JoinHandle::is_finished)
            })
            .map(|e| e.key().clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }

        let pending = self.services.writer.flush().await;
        if pending > 0 {
            debug!(pending, streams = expired.len(), "Keeping closed streams until their records are stored");
            return Vec::new();
        }
        for stream_id in &expired {
            self.streams.remove(stream_id);
        }
        debug!(count = expired.len(), "Released closed streams");
        expired
    }

    /// Stop every stream with reason `shutdown` and wait for their actors.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<(String, Arc<StreamEntry>)> = self
            .streams
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let stops = entries
            .iter()
            .filter(|(_, entry)| !entry.view.state().is_terminal())
            .map(|(id, _)| async move {
                let result = self
                    .request(id, |reply| StreamCommand::Stop {
                        reason: ReasonCode::Shutdown,
                        reply,
                    })
                    .await;
                if let Err(e) = result {
                    warn!(stream_id = %id, error = %e, "Failed to stop stream during shutdown");
                }
            });
        futures::future::join_all(stops).await;

        for (id, entry) in entries {
            let task = entry.task.lock().take();
            if let Some(task) = task
                && tokio::time::timeout(self.config.reply_timeout(), task)
                    .await
                    .is_err()
            {
                warn!(stream_id = %id, "Stream actor did not finish in time");
            }
        }
        info!("All streams stopped");
    }
}
