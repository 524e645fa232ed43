//! Per-stream actor.
//!
//! One task owns each stream. Commands, ingestion events and the single
//! outstanding boundary call are handled from one select loop, so operations
//! on a stream are serialized and its transition log is strictly ordered.
//! Dropping the outstanding call on stop cancels the wait.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::StreamCommand;
use crate::domain::consumer::close_reason;
use crate::domain::{
    Consumer, Producer, ReasonCode, Ssrc, Stream, StreamState, TransitionRecord,
};
use crate::ingest::{FailureKind, IngestEvent, IngestPolicy, IngestionSupervisor};
use crate::persistence::PersistenceWriter;
use crate::router::boundary::codec_params;
use crate::router::{IngressEndpoint, RouterGateway};
use crate::{Error, Result};

/// Read side of a stream, shared between its actor and the controller.
pub struct StreamView {
    stream: RwLock<Stream>,
    transitions: RwLock<Vec<TransitionRecord>>,
    producer: RwLock<Option<Producer>>,
    closed_at: RwLock<Option<Instant>>,
}

impl StreamView {
    pub(super) fn new(stream: Stream, created: TransitionRecord) -> Self {
        Self {
            stream: RwLock::new(stream),
            transitions: RwLock::new(vec![created]),
            producer: RwLock::new(None),
            closed_at: RwLock::new(None),
        }
    }

    /// Time since the stream reached `Closed`.
    pub fn closed_for(&self) -> Option<Duration> {
        self.closed_at.read().map(|at| at.elapsed())
    }

    pub fn snapshot(&self) -> Stream {
        self.stream.read().clone()
    }

    pub fn state(&self) -> StreamState {
        self.stream.read().state
    }

    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions.read().clone()
    }

    /// The active producer, if the stream has one.
    pub fn producer(&self) -> Option<Producer> {
        self.producer.read().clone()
    }
}

/// Services every stream actor drives.
pub(super) struct Services {
    pub supervisor: Arc<IngestionSupervisor>,
    pub gateway: Arc<RouterGateway>,
    pub writer: Arc<PersistenceWriter>,
    /// Source key to the id of the non-terminal stream using it.
    pub by_source: DashMap<String, String>,
}

enum Outcome {
    Ingress(Result<IngressEndpoint>),
    Registered {
        generation: u64,
        ssrc: Ssrc,
        result: Result<Producer>,
    },
}

pub(super) struct StreamActor {
    stream_id: String,
    source_key: String,
    view: Arc<StreamView>,
    services: Arc<Services>,
    policy: IngestPolicy,
    mailbox: mpsc::Receiver<StreamCommand>,
    events: Option<mpsc::Receiver<IngestEvent>>,
    ingress: Option<IngressEndpoint>,
    pending: Option<BoxFuture<'static, Outcome>>,
    /// SSRC of the registration in flight.
    registering: Option<Ssrc>,
    waiters: Vec<oneshot::Sender<Result<Stream>>>,
    generation: u64,
    producer_generation: Option<u64>,
    next_seq: u64,
}

impl StreamActor {
    pub(super) fn new(
        view: Arc<StreamView>,
        services: Arc<Services>,
        policy: IngestPolicy,
        mailbox: mpsc::Receiver<StreamCommand>,
    ) -> Self {
        let (stream_id, source_key) = {
            let stream = view.stream.read();
            (stream.id.clone(), stream.source.key().to_string())
        };
        let next_seq = view.transitions.read().len() as u64;
        Self {
            stream_id,
            source_key,
            view,
            services,
            policy,
            mailbox,
            events: None,
            ingress: None,
            pending: None,
            registering: None,
            waiters: Vec::new(),
            generation: 0,
            producer_generation: None,
            next_seq,
        }
    }

    pub(super) async fn run(mut self) {
        self.open_ingress();

        loop {
            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop(ReasonCode::Shutdown, None).await;
                        break;
                    }
                },
                event = next_event(&mut self.events) => self.handle_event(event).await,
                outcome = next_outcome(&mut self.pending) => self.handle_outcome(outcome).await,
            }

            if self.view.state() == StreamState::Closed {
                break;
            }
        }

        // Commands that raced with the teardown observe the final state.
        self.mailbox.close();
        while let Ok(command) = self.mailbox.try_recv() {
            let reply = match command {
                StreamCommand::AdvanceToReady { reply, .. }
                | StreamCommand::Fault { reply, .. }
                | StreamCommand::Reconnect { reply }
                | StreamCommand::Stop { reply, .. } => reply,
            };
            let _ = reply.send(Ok(self.view.snapshot()));
        }
        debug!(stream_id = %self.stream_id, "Stream actor finished");
    }

    async fn handle_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::AdvanceToReady { ssrc, reply } => {
                let state = self.view.state();
                if !matches!(state, StreamState::Initializing | StreamState::Error)
                    || self.view.producer.read().is_some()
                {
                    let _ = reply.send(Err(Error::InvalidStateTransition {
                        from: state.to_string(),
                        to: StreamState::Ready.to_string(),
                    }));
                    return;
                }
                if self.ingress.is_none() {
                    let _ = reply.send(Err(Error::validation(
                        "ingress endpoint is not ready yet",
                    )));
                    return;
                }
                self.waiters.push(reply);
                if self.registering.is_none() {
                    self.begin_registration(self.generation, ssrc);
                }
            }
            StreamCommand::Fault {
                reason,
                detail,
                reply,
            } => {
                self.fault(reason, detail).await;
                let _ = reply.send(Ok(self.view.snapshot()));
            }
            StreamCommand::Reconnect { reply } => {
                let _ = reply.send(self.reconnect());
            }
            StreamCommand::Stop { reason, reply } => {
                self.stop(reason, None).await;
                let _ = reply.send(Ok(self.view.snapshot()));
            }
        }
    }

    /// Manual retry from `Error`. Streams still under supervision recover on
    /// their own and are returned unchanged.
    fn reconnect(&mut self) -> Result<Stream> {
        let state = self.view.state();
        if state != StreamState::Error {
            return Err(Error::InvalidStateTransition {
                from: state.to_string(),
                to: StreamState::Ready.to_string(),
            });
        }
        if self.ingress.is_some() || self.pending.is_some() {
            debug!(stream_id = %self.stream_id, "Reconnect ignored, recovery already in progress");
            return Ok(self.view.snapshot());
        }

        info!(stream_id = %self.stream_id, "Reconnecting stream");
        self.open_ingress();
        Ok(self.view.snapshot())
    }

    fn open_ingress(&mut self) {
        let gateway = self.services.gateway.clone();
        let stream_id = self.stream_id.clone();
        self.pending = Some(Box::pin(async move {
            Outcome::Ingress(gateway.create_ingress(&stream_id).await)
        }));
    }

    async fn handle_event(&mut self, event: IngestEvent) {
        if self.view.state().is_terminal() {
            return;
        }
        match event {
            IngestEvent::Started { generation, pid } => {
                self.generation = generation;
                debug!(stream_id = %self.stream_id, generation, ?pid, "Ingestion generation started");
            }
            IngestEvent::SourceIdentified { generation, ssrc } => {
                self.generation = generation;
                let state = self.view.state();
                let idle = self.view.producer.read().is_none() && self.registering.is_none();
                if matches!(state, StreamState::Initializing | StreamState::Error) && idle {
                    self.begin_registration(generation, ssrc);
                } else {
                    debug!(stream_id = %self.stream_id, generation, %ssrc, %state, "Source identifier ignored");
                }
            }
            IngestEvent::Throughput {
                generation,
                packets,
                bytes_per_sec,
                ..
            } => {
                if self.view.state() == StreamState::Ready
                    && self.producer_generation == Some(generation)
                    && packets > 0
                {
                    self.transition(
                        StreamState::Live,
                        ReasonCode::ThroughputConfirmed,
                        Some(format!("{bytes_per_sec} B/s")),
                    );
                }
            }
            IngestEvent::Failed {
                generation,
                kind,
                will_restart,
            } => {
                let (reason, detail) = match kind {
                    FailureKind::Crashed(detail) => (ReasonCode::ProcessCrashed, Some(detail)),
                    FailureKind::DiscoveryTimeout => {
                        let window_ms = self.policy.discovery_window.as_millis() as u64;
                        let detail = Error::DiscoveryTimeout { window_ms }.to_string();
                        (ReasonCode::DiscoveryTimeout, Some(detail))
                    }
                    FailureKind::LaunchFailed(detail) => {
                        (ReasonCode::IngestionStartFailed, Some(detail))
                    }
                };
                info!(stream_id = %self.stream_id, generation, %reason, will_restart, "Ingestion failed");
                self.cancel_registration();
                self.retire_producer(close_reason::PRODUCER_REPLACED).await;
                self.enter_error(reason, detail);
            }
            IngestEvent::RetryExhausted { failures } => {
                self.stop(
                    ReasonCode::IngestionRetryExhausted,
                    Some(format!("{failures} failures within the retry window")),
                )
                .await;
            }
        }
    }

    async fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Ingress(Ok(ingress)) => self.start_ingestion(ingress).await,
            Outcome::Ingress(Err(e)) => {
                warn!(stream_id = %self.stream_id, error = %e, "Failed to create ingress");
                self.enter_error(ReasonCode::IngressFailed, Some(e.to_string()));
            }
            Outcome::Registered {
                generation,
                ssrc,
                result,
            } => {
                self.registering = None;
                self.on_registered(generation, ssrc, result).await;
                let snapshot = self.view.snapshot();
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(snapshot.clone()));
                }
            }
        }
    }

    async fn start_ingestion(&mut self, ingress: IngressEndpoint) {
        let source = {
            let mut stream = self.view.stream.write();
            stream.codec_params = Some(codec_params(&ingress));
            stream.updated_at = chrono::Utc::now();
            self.services.writer.stream(&stream);
            stream.source.clone()
        };

        let rtp_addr = ingress.rtp_addr;
        self.ingress = Some(ingress);
        match self
            .services
            .supervisor
            .start(&self.stream_id, source, self.policy.clone(), rtp_addr)
            .await
        {
            Ok(events) => self.events = Some(events),
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "Failed to start ingestion");
                self.enter_error(ReasonCode::IngestionStartFailed, Some(e.to_string()));
                self.release_ingestion().await;
            }
        }
    }

    fn begin_registration(&mut self, generation: u64, ssrc: Ssrc) {
        let Some(ingress_id) = self.ingress.as_ref().map(|i| i.id.clone()) else {
            return;
        };
        let gateway = self.services.gateway.clone();
        let stream_id = self.stream_id.clone();
        self.registering = Some(ssrc);
        self.pending = Some(Box::pin(async move {
            let result = gateway.register_producer(&stream_id, &ingress_id, ssrc).await;
            Outcome::Registered {
                generation,
                ssrc,
                result,
            }
        }));
    }

    async fn on_registered(&mut self, generation: u64, ssrc: Ssrc, result: Result<Producer>) {
        let state = self.view.state();
        match result {
            Ok(producer)
                if generation == self.generation
                    && matches!(state, StreamState::Initializing | StreamState::Error) =>
            {
                self.services.writer.producer(&producer);
                *self.view.producer.write() = Some(producer);
                self.producer_generation = Some(generation);
                self.transition(
                    StreamState::Ready,
                    ReasonCode::SourceIdentified,
                    Some(format!("ssrc {ssrc}")),
                );
            }
            Ok(mut producer) => {
                debug!(stream_id = %self.stream_id, generation, "Discarding stale producer");
                self.services
                    .gateway
                    .close_producer(&mut producer, close_reason::PRODUCER_REPLACED)
                    .await;
                self.services.writer.producer(&producer);
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, generation, %ssrc, error = %e, "Producer registration failed");
                let detail = Some(e.to_string());
                match state {
                    StreamState::Initializing => {
                        self.transition(
                            StreamState::Error,
                            ReasonCode::ProducerRegistrationFailed,
                            detail,
                        );
                        self.release_ingestion().await;
                    }
                    StreamState::Error => {
                        self.stop(ReasonCode::ProducerRegistrationFailed, detail)
                            .await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn fault(&mut self, reason: ReasonCode, detail: Option<String>) {
        let state = self.view.state();
        if state.is_terminal() {
            return;
        }
        if reason == ReasonCode::IngestionRetryExhausted {
            self.stop(reason, detail).await;
            return;
        }
        if state == StreamState::Error {
            self.enter_error(reason, detail);
            return;
        }

        self.cancel_registration();
        self.retire_producer(close_reason::PRODUCER_REPLACED).await;
        self.enter_error(reason, detail);

        match self.services.supervisor.restart(&self.stream_id) {
            Ok(()) => info!(stream_id = %self.stream_id, %reason, "Ingestion restart requested"),
            Err(Error::RetryExhausted { failures, .. }) => {
                self.stop(
                    ReasonCode::IngestionRetryExhausted,
                    Some(format!("{failures} failures within the retry window")),
                )
                .await;
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "Ingestion restart unavailable");
                self.stop(reason, Some(e.to_string())).await;
            }
        }
    }

    /// `Stopped` with `reason`, release everything, then `Closed`.
    async fn stop(&mut self, reason: ReasonCode, detail: Option<String>) {
        if self.view.state().is_terminal() {
            return;
        }
        self.pending = None;
        self.registering = None;

        self.transition(StreamState::Stopped, reason, detail);
        self.services
            .by_source
            .remove_if(&self.source_key, |_, id| id == &self.stream_id);

        let closed = self
            .services
            .gateway
            .close_stream_consumers(&self.stream_id, close_reason::STREAM_STOPPED)
            .await;
        self.persist_consumers(&closed);
        self.retire_producer(close_reason::STREAM_STOPPED).await;
        self.release_ingestion().await;

        self.transition(StreamState::Closed, ReasonCode::CleanupComplete, None);

        let snapshot = self.view.snapshot();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(snapshot.clone()));
        }
    }

    fn enter_error(&mut self, reason: ReasonCode, detail: Option<String>) {
        if self.view.state() == StreamState::Error {
            let mut stream = self.view.stream.write();
            stream.note_fault(reason);
            self.services.writer.stream(&stream);
            debug!(stream_id = %self.stream_id, %reason, "Fault recorded while in error");
        } else {
            self.transition(StreamState::Error, reason, detail);
        }
    }

    fn cancel_registration(&mut self) {
        if self.registering.take().is_some() {
            self.pending = None;
            let snapshot = self.view.snapshot();
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(Ok(snapshot.clone()));
            }
        }
    }

    async fn retire_producer(&mut self, reason: &str) {
        self.producer_generation = None;
        let producer = self.view.producer.write().take();
        if let Some(mut producer) = producer {
            let closed = self
                .services
                .gateway
                .close_producer(&mut producer, reason)
                .await;
            self.persist_consumers(&closed);
            self.services.writer.producer(&producer);
        }
    }

    async fn release_ingestion(&mut self) {
        self.events = None;
        if let Err(e) = self.services.supervisor.stop(&self.stream_id).await {
            warn!(stream_id = %self.stream_id, error = %e, "Failed to stop ingestion");
        }
        if let Some(ingress) = self.ingress.take()
            && let Err(e) = self.services.gateway.close_ingress(&ingress.id).await
        {
            warn!(stream_id = %self.stream_id, ingress_id = %ingress.id, error = %e, "Failed to close ingress");
        }
    }

    fn persist_consumers(&self, consumers: &[Consumer]) {
        for consumer in consumers {
            self.services.writer.consumer(consumer);
        }
    }

    /// Apply and record one transition. Illegal pairs are refused and logged.
    fn transition(&mut self, to: StreamState, reason: ReasonCode, detail: Option<String>) -> bool {
        let applied = {
            let mut stream = self.view.stream.write();
            stream
                .apply(to, reason, detail, self.next_seq)
                .map(|record| (record, stream.clone()))
        };
        match applied {
            Ok((record, stream)) => {
                self.next_seq += 1;
                self.services.writer.stream(&stream);
                self.services.writer.transition(&record);
                info!(
                    stream_id = %self.stream_id,
                    seq = record.seq,
                    from = ?record.from_state,
                    to = %to,
                    reason = %reason,
                    "Stream transition"
                );
                self.view.transitions.write().push(record);
                if to == StreamState::Closed {
                    *self.view.closed_at.write() = Some(Instant::now());
                }
                true
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, %reason, error = %e, "Transition refused");
                false
            }
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<IngestEvent>>) -> IngestEvent {
    if let Some(rx) = events {
        if let Some(event) = rx.recv().await {
            return event;
        }
        *events = None;
    }
    std::future::pending().await
}

async fn next_outcome(pending: &mut Option<BoxFuture<'static, Outcome>>) -> Outcome {
    if let Some(fut) = pending {
        let outcome = fut.await;
        *pending = None;
        return outcome;
    }
    std::future::pending().await
}
