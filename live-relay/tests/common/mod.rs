//! Shared fixtures for relay integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use live_relay::config::RelayConfig;
use live_relay::domain::{Ssrc, Stream, StreamState, TransitionRecord};
use live_relay::ingest::rtp::RtpHeader;
use live_relay::ingest::{IngestEngine, IngestLaunch, IngestProcess, ProcessExit};
use live_relay::persistence::{MemoryRepository, StreamRepository};
use live_relay::router::LoopbackBoundary;
use live_relay::{Error, Relay, Result};

/// What one launched process generation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Send RTP every 20ms until stopped.
    Stream,
    /// Run without sending anything.
    Silent,
    /// Exit with a failure status right away.
    CrashImmediately,
    /// Refuse to launch.
    FailLaunch,
}

struct ProcessControl {
    crash: Notify,
    silent: AtomicBool,
}

/// Engine whose processes follow a per-launch script and send real RTP to
/// the launch target over loopback UDP. Each launch picks a random SSRC.
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    launches: AtomicU64,
    ssrcs: Mutex<Vec<Ssrc>>,
    processes: Mutex<Vec<Arc<ProcessControl>>>,
}

impl ScriptedEngine {
    pub fn new(fallback: Behavior) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            launches: AtomicU64::new(0),
            ssrcs: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming() -> Self {
        Self::new(Behavior::Stream)
    }

    /// Behaviors for the next launches, consumed in order before the
    /// fallback applies.
    pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.script.lock().extend(behaviors);
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn ssrcs(&self) -> Vec<Ssrc> {
        self.ssrcs.lock().clone()
    }

    /// Make the most recent process exit with a failure status.
    pub fn crash_latest(&self) {
        if let Some(control) = self.processes.lock().last() {
            control.crash.notify_one();
        }
    }

    /// Make every running process stop sending while staying alive.
    pub fn silence_all(&self) {
        for control in self.processes.lock().iter() {
            control.silent.store(true, Ordering::SeqCst);
        }
    }

    /// Make the most recent process stop sending while staying alive.
    pub fn silence_latest(&self) {
        if let Some(control) = self.processes.lock().last() {
            control.silent.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl IngestEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn launch(&self, launch: IngestLaunch) -> Result<IngestProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let behavior = self.script.lock().pop_front().unwrap_or(self.fallback);

        if behavior == Behavior::FailLaunch {
            return Err(Error::Other("scripted launch failure".into()));
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        if behavior == Behavior::CrashImmediately {
            let _ = tx.send(ProcessExit {
                code: Some(1),
                description: "exit code 1".into(),
                requested: false,
            });
            return Ok(IngestProcess::new(Some(4000), rx, cancel));
        }

        let ssrc = Ssrc(rand::random::<u32>());
        self.ssrcs.lock().push(ssrc);
        let control = Arc::new(ProcessControl {
            crash: Notify::new(),
            silent: AtomicBool::new(behavior == Behavior::Silent),
        });
        self.processes.lock().push(control.clone());

        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut seq = 0u16;
            loop {
                if !control.silent.load(Ordering::SeqCst) {
                    let packet = RtpHeader {
                        padding: false,
                        extension: false,
                        csrc_count: 0,
                        marker: false,
                        payload_type: 96,
                        sequence: seq,
                        timestamp: u32::from(seq) * 3000,
                        ssrc,
                    }
                    .packet(&[0u8; 400]);
                    let _ = socket.send_to(&packet, launch.rtp_target).await;
                    seq = seq.wrapping_add(1);
                }
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = tx.send(ProcessExit::requested("stopped"));
                        return;
                    }
                    _ = control.crash.notified() => {
                        let _ = tx.send(ProcessExit {
                            code: Some(1),
                            description: "exit code 1".into(),
                            requested: false,
                        });
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        });

        Ok(IngestProcess::new(Some(4001), rx, cancel))
    }
}

/// Configuration with short windows so scenarios finish quickly.
pub fn test_config(archive_root: &std::path::Path) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.ingest.archive_root = archive_root.to_path_buf();
    config.ingest.discovery_window_ms = 500;
    config.ingest.report_interval_ms = 100;
    config.ingest.backoff_base_ms = 10;
    config.ingest.backoff_max_ms = 50;
    config.ingest.stop_grace_ms = 200;
    config.router.observe_grace_ms = 1_000;
    config.router.request_timeout_ms = 2_000;
    config.health.interval_ms = 100;
    config.controller.reply_timeout_ms = 5_000;
    config.persistence.database_url = "memory".into();
    config.persistence.retry_base_ms = 10;
    config.persistence.retry_max_ms = 50;
    config
}

pub struct Harness {
    pub relay: Arc<Relay>,
    pub engine: Arc<ScriptedEngine>,
    pub boundary: Arc<LoopbackBoundary>,
    pub repository: Arc<MemoryRepository>,
    _archive: TempDir,
}

impl Harness {
    pub fn start(engine: ScriptedEngine) -> Self {
        Self::start_with(engine, |_| {})
    }

    pub fn start_with(engine: ScriptedEngine, tweak: impl FnOnce(&mut RelayConfig)) -> Self {
        let archive = tempfile::tempdir().unwrap();
        let mut config = test_config(archive.path());
        tweak(&mut config);

        let engine = Arc::new(engine);
        let boundary = Arc::new(LoopbackBoundary::new(config.router.observe_grace()));
        let repository = Arc::new(MemoryRepository::new());
        let relay = Arc::new(Relay::new(
            config,
            engine.clone(),
            boundary.clone(),
            repository.clone() as Arc<dyn StreamRepository>,
        ));
        relay.start();

        Self {
            relay,
            engine,
            boundary,
            repository,
            _archive: archive,
        }
    }

    pub fn create(&self, source: &str) -> Stream {
        self.relay
            .controller()
            .create(source, None, Default::default())
            .unwrap()
            .stream
    }

    pub fn state(&self, stream_id: &str) -> StreamState {
        self.relay.controller().snapshot(stream_id).unwrap().state
    }

    pub async fn transitions(&self, stream_id: &str) -> Vec<TransitionRecord> {
        self.relay.controller().transitions(stream_id).await.unwrap()
    }

    /// Poll until `pred` holds for the stream or `timeout` passes.
    pub async fn wait_until(
        &self,
        stream_id: &str,
        timeout: Duration,
        pred: impl Fn(&Stream) -> bool,
    ) -> Stream {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let stream = self.relay.controller().snapshot(stream_id).unwrap();
            if pred(&stream) {
                return stream;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "stream {stream_id} did not reach the expected condition, last state {}",
                    stream.state
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for_state(&self, stream_id: &str, state: StreamState) -> Stream {
        self.wait_until(stream_id, Duration::from_secs(10), |s| s.state == state)
            .await
    }

    pub async fn shutdown(self) {
        self.relay.shutdown().await;
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn states(records: &[TransitionRecord]) -> Vec<StreamState> {
    records.iter().map(|r| r.to_state).collect()
}

/// Every recorded (from, to) pair is a legal edge and seqs are contiguous.
pub fn assert_valid_path(records: &[TransitionRecord]) {
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.seq, i as u64, "transition seqs must be contiguous");
        match record.from_state {
            None => assert_eq!(i, 0, "only the creation record has no source state"),
            Some(from) => {
                assert!(
                    from.can_transition_to(record.to_state),
                    "illegal transition {from} -> {}",
                    record.to_state
                );
                let previous = i.checked_sub(1).and_then(|p| records.get(p));
                assert_eq!(Some(from), previous.map(|r| r.to_state));
            }
        }
    }
}
