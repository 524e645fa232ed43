//! Ingestion supervisor.
//!
//! Owns one ingest process per stream, stored in an arena keyed by stream id.
//! Each slot runs a task that launches process generations, captures the
//! source identifier through the stream's [`IngestTap`], reports throughput,
//! and relaunches on failure while the restart budget allows. Restart
//! history lives in the slot, so one stream's failures never contend with
//! another's.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{IngestEngine, IngestLaunch, IngestProcess, ProcessExit};
use super::events::{FailureKind, IngestEvent};
use super::restart_tracker::{RestartDecision, RestartTracker, RestartTrackerConfig};
use super::tap::IngestTap;
use crate::config::{IngestConfig, StreamPolicy};
use crate::domain::{SourceDescriptor, Ssrc};
use crate::{Error, Result};

/// Extra time allowed on top of the stop grace when joining a slot task.
const JOIN_SLACK: Duration = Duration::from_secs(2);

/// Per-stream supervision limits after applying overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestPolicy {
    pub discovery_window: Duration,
    pub max_restarts: usize,
    pub stall_timeout: Duration,
}

impl IngestPolicy {
    pub fn resolve(config: &IngestConfig, overrides: &StreamPolicy) -> Self {
        Self {
            discovery_window: overrides
                .discovery_window_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.discovery_window()),
            max_restarts: overrides.max_restarts.unwrap_or(config.max_restarts),
            stall_timeout: overrides
                .stall_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.stall_timeout()),
        }
    }
}

/// Process identity and counters for a stream's ingestion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionHandle {
    pub pid: Option<u32>,
    pub generation: u64,
    /// Set once per generation.
    pub ssrc: Option<Ssrc>,
    pub restarts: u64,
    pub alive: bool,
    pub exhausted: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub bytes_per_sec: u64,
}

/// Liveness snapshot read by the health monitor.
#[derive(Debug, Clone, Serialize)]
pub struct IngestLiveness {
    pub alive: bool,
    pub pid: Option<u32>,
    pub generation: u64,
    pub ssrc: Option<Ssrc>,
    pub restarts: u64,
    pub bytes: u64,
    pub packets: u64,
    pub bytes_per_sec: u64,
    pub idle_ms: u64,
    pub stalled: bool,
    pub exhausted: bool,
}

struct Slot {
    stream_id: String,
    source: SourceDescriptor,
    policy: IngestPolicy,
    tap: IngestTap,
    cancel: CancellationToken,
    handle: RwLock<IngestionHandle>,
    restarts: Mutex<RestartTracker>,
    restart_tx: mpsc::Sender<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct IngestionSupervisor {
    config: IngestConfig,
    engine: Arc<dyn IngestEngine>,
    slots: DashMap<String, Arc<Slot>>,
    restart_config: RestartTrackerConfig,
}

impl IngestionSupervisor {
    pub fn new(config: IngestConfig, engine: Arc<dyn IngestEngine>) -> Self {
        let restart_config = RestartTrackerConfig::from(&config);
        Self {
            config,
            engine,
            slots: DashMap::new(),
            restart_config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Start supervising ingestion for a stream.
    ///
    /// The real-time output is forwarded to `ingress`. Events for the stream
    /// arrive on the returned receiver until the slot stops.
    pub async fn start(
        &self,
        stream_id: &str,
        source: SourceDescriptor,
        policy: IngestPolicy,
        ingress: SocketAddr,
    ) -> Result<mpsc::Receiver<IngestEvent>> {
        if self.slots.contains_key(stream_id) {
            return Err(Error::validation(format!(
                "ingestion already running for stream {stream_id}"
            )));
        }
        if !self.engine.is_available() {
            return Err(Error::Other(format!(
                "Engine {} is not available",
                self.engine.name()
            )));
        }

        let cancel = CancellationToken::new();
        let tap = IngestTap::bind(stream_id, ingress, cancel.child_token()).await?;
        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity);
        let (restart_tx, restart_rx) = mpsc::channel(1);

        let slot = Arc::new(Slot {
            stream_id: stream_id.to_string(),
            source,
            policy,
            tap,
            cancel,
            handle: RwLock::new(IngestionHandle::default()),
            restarts: Mutex::new(RestartTracker::new(stream_id, self.restart_config.clone())),
            restart_tx,
            task: Mutex::new(None),
        });

        match self.slots.entry(stream_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::validation(format!(
                    "ingestion already running for stream {stream_id}"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(slot.clone());
            }
        }

        let runner = SlotRunner {
            slot: slot.clone(),
            engine: self.engine.clone(),
            events: events_tx,
            archive_dir: self.archive_dir(stream_id),
            report_interval: self.config.report_interval(),
            stop_grace: self.config.stop_grace(),
        };
        let task = tokio::spawn(runner.run(restart_rx));
        *slot.task.lock() = Some(task);

        info!(
            stream_id = %stream_id,
            engine = self.engine.name(),
            tap = %slot.tap.local_addr(),
            %ingress,
            "Ingestion supervision started"
        );
        Ok(events_rx)
    }

    /// Stop ingestion for a stream. Safe to call multiple times.
    pub async fn stop(&self, stream_id: &str) -> Result<()> {
        let Some((_, slot)) = self.slots.remove(stream_id) else {
            return Ok(());
        };

        slot.cancel.cancel();
        slot.tap.close();

        let task = slot.task.lock().take();
        if let Some(task) = task
            && tokio::time::timeout(self.config.stop_grace() + JOIN_SLACK, task)
                .await
                .is_err()
        {
            warn!(stream_id = %stream_id, "Ingestion task did not finish in time");
        }

        info!(stream_id = %stream_id, "Ingestion stopped");
        Ok(())
    }

    /// Kill the current process and relaunch it, counting toward the
    /// restart budget.
    pub fn restart(&self, stream_id: &str) -> Result<()> {
        let slot = self
            .slots
            .get(stream_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::not_found("Ingestion", stream_id))?;

        if slot.handle.read().exhausted {
            return Err(Error::RetryExhausted {
                stream_id: stream_id.to_string(),
                failures: slot.restarts.lock().recent_failures(),
            });
        }

        let decision = slot.restarts.lock().record_failure(slot.policy.max_restarts);
        match decision {
            RestartDecision::Restart { backoff, attempt } => {
                debug!(stream_id = %stream_id, attempt, ?backoff, "Restart requested");
                match slot.restart_tx.try_send(backoff) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Shutdown),
                }
            }
            RestartDecision::Exhausted { failures } => {
                {
                    let mut handle = slot.handle.write();
                    handle.exhausted = true;
                    handle.alive = false;
                }
                slot.cancel.cancel();
                Err(Error::RetryExhausted {
                    stream_id: stream_id.to_string(),
                    failures,
                })
            }
        }
    }

    pub fn handle(&self, stream_id: &str) -> Option<IngestionHandle> {
        self.slots.get(stream_id).map(|s| s.handle.read().clone())
    }

    pub fn liveness(&self, stream_id: &str) -> Option<IngestLiveness> {
        let slot = self.slots.get(stream_id)?;
        let handle = slot.handle.read().clone();
        let tap = slot.tap.snapshot();
        let stalled = handle.alive && tap.idle > slot.policy.stall_timeout;

        Some(IngestLiveness {
            alive: handle.alive,
            pid: handle.pid,
            generation: handle.generation,
            ssrc: handle.ssrc,
            restarts: handle.restarts,
            bytes: tap.bytes,
            packets: tap.packets,
            bytes_per_sec: handle.bytes_per_sec,
            idle_ms: tap.idle.as_millis() as u64,
            stalled,
            exhausted: handle.exhausted,
        })
    }

    pub fn is_supervising(&self, stream_id: &str) -> bool {
        self.slots.contains_key(stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    fn archive_dir(&self, stream_id: &str) -> PathBuf {
        self.config.archive_root.join(stream_id)
    }
}

/// How one process generation ended.
enum GenerationEnd {
    Cancelled,
    Failed(FailureKind),
    /// Restart requested from outside; already counted against the budget.
    Restart(Duration),
}

struct SlotRunner {
    slot: Arc<Slot>,
    engine: Arc<dyn IngestEngine>,
    events: mpsc::Sender<IngestEvent>,
    archive_dir: PathBuf,
    report_interval: Duration,
    stop_grace: Duration,
}

impl SlotRunner {
    async fn run(self, mut restart_rx: mpsc::Receiver<Duration>) {
        let stream_id = self.slot.stream_id.clone();
        let mut generation = 0u64;

        loop {
            if self.slot.cancel.is_cancelled() {
                break;
            }
            // A restart requested while already relaunching is absorbed.
            while restart_rx.try_recv().is_ok() {}

            generation += 1;
            let end = self.run_generation(generation, &mut restart_rx).await;
            {
                let mut handle = self.slot.handle.write();
                handle.alive = false;
                handle.pid = None;
            }

            let backoff = match end {
                GenerationEnd::Cancelled => break,
                GenerationEnd::Restart(backoff) => {
                    info!(stream_id = %stream_id, generation, "Ingestion restarting on request");
                    backoff
                }
                GenerationEnd::Failed(kind) => {
                    let decision = self
                        .slot
                        .restarts
                        .lock()
                        .record_failure(self.slot.policy.max_restarts);
                    match decision {
                        RestartDecision::Restart { backoff, attempt } => {
                            warn!(
                                stream_id = %stream_id,
                                generation,
                                attempt,
                                ?kind,
                                ?backoff,
                                "Ingestion generation failed, restarting"
                            );
                            self.emit(IngestEvent::Failed {
                                generation,
                                kind,
                                will_restart: true,
                            })
                            .await;
                            backoff
                        }
                        RestartDecision::Exhausted { failures } => {
                            self.slot.handle.write().exhausted = true;
                            self.emit(IngestEvent::Failed {
                                generation,
                                kind,
                                will_restart: false,
                            })
                            .await;
                            self.emit(IngestEvent::RetryExhausted { failures }).await;
                            break;
                        }
                    }
                }
            };

            tokio::select! {
                _ = self.slot.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        debug!(stream_id = %stream_id, generation, "Ingestion task finished");
    }

    async fn run_generation(
        &self,
        generation: u64,
        restart_rx: &mut mpsc::Receiver<Duration>,
    ) -> GenerationEnd {
        let slot = &self.slot;
        slot.tap.begin_generation(generation);
        let restarts = slot.restarts.lock().total_restarts();
        {
            let mut handle = slot.handle.write();
            handle.generation = generation;
            handle.ssrc = None;
            handle.restarts = restarts;
            handle.bytes_per_sec = 0;
        }

        let launch = IngestLaunch {
            stream_id: slot.stream_id.clone(),
            generation,
            source: slot.source.clone(),
            rtp_target: slot.tap.local_addr(),
            archive_dir: self.archive_dir.clone(),
        };
        let mut process = match self.engine.launch(launch).await {
            Ok(process) => process,
            Err(e) => {
                warn!(stream_id = %slot.stream_id, generation, error = %e, "Failed to launch ingestion");
                return GenerationEnd::Failed(FailureKind::LaunchFailed(e.to_string()));
            }
        };

        {
            let mut handle = slot.handle.write();
            handle.pid = process.pid;
            handle.alive = true;
            handle.started_at = Some(Utc::now());
        }
        self.emit(IngestEvent::Started {
            generation,
            pid: process.pid,
        })
        .await;

        // Discovery: the first valid packet of this generation names the source.
        let discovery = slot
            .tap
            .wait_for_ssrc(generation, slot.policy.discovery_window);
        tokio::pin!(discovery);

        let ssrc = tokio::select! {
            _ = slot.cancel.cancelled() => {
                self.stop_process(process).await;
                return GenerationEnd::Cancelled;
            }
            Some(backoff) = restart_rx.recv() => {
                self.stop_process(process).await;
                return GenerationEnd::Restart(backoff);
            }
            exit = &mut process.exit => {
                return GenerationEnd::Failed(FailureKind::Crashed(describe(exit)));
            }
            found = &mut discovery => match found {
                Some(ssrc) => ssrc,
                None => {
                    warn!(
                        stream_id = %slot.stream_id,
                        generation,
                        window = ?slot.policy.discovery_window,
                        "No source identifier observed"
                    );
                    self.stop_process(process).await;
                    return GenerationEnd::Failed(FailureKind::DiscoveryTimeout);
                }
            },
        };

        slot.handle.write().ssrc = Some(ssrc);
        info!(stream_id = %slot.stream_id, generation, %ssrc, "Source identified");
        self.emit(IngestEvent::SourceIdentified { generation, ssrc })
            .await;

        // Steady state: periodic throughput reports until the process ends.
        let base = slot.tap.snapshot();
        let mut last = base;
        let mut ticker = tokio::time::interval(self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = slot.cancel.cancelled() => {
                    self.stop_process(process).await;
                    return GenerationEnd::Cancelled;
                }
                Some(backoff) = restart_rx.recv() => {
                    self.stop_process(process).await;
                    return GenerationEnd::Restart(backoff);
                }
                exit = &mut process.exit => {
                    return GenerationEnd::Failed(FailureKind::Crashed(describe(exit)));
                }
                _ = ticker.tick() => {
                    let now = slot.tap.snapshot();
                    let secs = self.report_interval.as_secs_f64().max(0.001);
                    let bytes_per_sec = ((now.bytes - last.bytes) as f64 / secs) as u64;
                    {
                        let mut handle = slot.handle.write();
                        handle.bytes_per_sec = bytes_per_sec;
                        if now.packets > last.packets {
                            handle.last_activity = Some(Utc::now());
                        }
                    }
                    last = now;

                    let report = IngestEvent::Throughput {
                        generation,
                        bytes: now.bytes - base.bytes,
                        packets: now.packets - base.packets,
                        bytes_per_sec,
                    };
                    // Reports are periodic; drop when the controller is behind.
                    if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(report) {
                        debug!(stream_id = %slot.stream_id, "Throughput report dropped");
                    }
                }
            }
        }
    }

    async fn stop_process(&self, mut process: IngestProcess) {
        process.stop();
        match tokio::time::timeout(self.stop_grace + JOIN_SLACK, &mut process.exit).await {
            Ok(Ok(exit)) => {
                debug!(stream_id = %self.slot.stream_id, exit = %exit.description, "Ingestion process stopped")
            }
            Ok(Err(_)) => {}
            Err(_) => warn!(stream_id = %self.slot.stream_id, "Ingestion process did not report exit"),
        }
    }

    async fn emit(&self, event: IngestEvent) {
        tokio::select! {
            _ = self.slot.cancel.cancelled() => {}
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!(stream_id = %self.slot.stream_id, "Ingest event receiver dropped");
                }
            }
        }
    }
}

fn describe(exit: std::result::Result<ProcessExit, oneshot::error::RecvError>) -> String {
    match exit {
        Ok(exit) => exit.description,
        Err(_) => "exit status lost".to_string(),
    }
}
