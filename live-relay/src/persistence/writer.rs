//! Background persistence writer.
//!
//! State transitions never wait on storage. Writes are queued here and
//! applied in order by one task. A write that still fails after its retries
//! stays at the head of the backlog and is replayed before anything newer,
//! on the next queued write or the next reconcile tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::repository::StreamRepository;
use super::retry::{RetryPolicy, with_retry};
use crate::Result;
use crate::domain::{Consumer, Producer, Stream, TransitionRecord};

#[derive(Debug, Clone)]
pub enum WriteOp {
    Stream(Stream),
    Producer(Producer),
    Consumer(Consumer),
    Transition(TransitionRecord),
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Stream(_) => "upsert_stream",
            Self::Producer(_) => "upsert_producer",
            Self::Consumer(_) => "upsert_consumer",
            Self::Transition(_) => "append_transition",
        }
    }

    async fn apply(&self, repo: &dyn StreamRepository) -> Result<()> {
        match self {
            Self::Stream(stream) => repo.upsert_stream(stream).await,
            Self::Producer(producer) => repo.upsert_producer(producer).await,
            Self::Consumer(consumer) => repo.upsert_consumer(consumer).await,
            Self::Transition(record) => repo.append_transition(record).await,
        }
    }
}

enum Command {
    Write(WriteOp),
    Flush(oneshot::Sender<usize>),
    Close,
}

#[derive(Debug, Default)]
struct WriterStats {
    applied: AtomicU64,
    failed_attempts: AtomicU64,
    backlog: AtomicUsize,
}

pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<WriterStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWriter {
    pub fn spawn(repository: Arc<dyn StreamRepository>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());
        let task = tokio::spawn(run(repository, policy, rx, stats.clone()));
        Self {
            tx,
            stats,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn submit(&self, op: WriteOp) {
        if self.tx.send(Command::Write(op)).is_err() {
            warn!("Persistence writer is closed, dropping write");
        }
    }

    pub fn stream(&self, stream: &Stream) {
        self.submit(WriteOp::Stream(stream.clone()));
    }

    pub fn producer(&self, producer: &Producer) {
        self.submit(WriteOp::Producer(producer.clone()));
    }

    pub fn consumer(&self, consumer: &Consumer) {
        self.submit(WriteOp::Consumer(consumer.clone()));
    }

    pub fn transition(&self, record: &TransitionRecord) {
        self.submit(WriteOp::Transition(record.clone()));
    }

    /// Wait until everything queued so far has been attempted. Returns the
    /// number of writes still pending reconciliation.
    pub async fn flush(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(reply_tx)).is_err() {
            return self.backlog_len();
        }
        reply_rx.await.unwrap_or_else(|_| self.backlog_len())
    }

    /// Drain the queue and stop the writer task.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Close);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.stats.backlog.load(Ordering::Relaxed)
    }

    pub fn applied_count(&self) -> u64 {
        self.stats.applied.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.stats.failed_attempts.load(Ordering::Relaxed)
    }
}

async fn run(
    repository: Arc<dyn StreamRepository>,
    policy: RetryPolicy,
    mut rx: mpsc::UnboundedReceiver<Command>,
    stats: Arc<WriterStats>,
) {
    let mut backlog: VecDeque<WriteOp> = VecDeque::new();
    let mut reconcile = tokio::time::interval(policy.max_delay.max(policy.base_delay));
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Write(op)) => {
                    backlog.push_back(op);
                    drain(repository.as_ref(), &policy, &mut backlog, &stats).await;
                }
                Some(Command::Flush(reply)) => {
                    drain(repository.as_ref(), &policy, &mut backlog, &stats).await;
                    let _ = reply.send(backlog.len());
                }
                Some(Command::Close) | None => break,
            },
            _ = reconcile.tick(), if !backlog.is_empty() => {
                drain(repository.as_ref(), &policy, &mut backlog, &stats).await;
            }
        }
    }

    drain(repository.as_ref(), &policy, &mut backlog, &stats).await;
    if backlog.is_empty() {
        info!("Persistence writer stopped");
    } else {
        warn!(pending = backlog.len(), "Persistence writer stopped with unwritten records");
    }
}

async fn drain(
    repository: &dyn StreamRepository,
    policy: &RetryPolicy,
    backlog: &mut VecDeque<WriteOp>,
    stats: &WriterStats,
) {
    while let Some(op) = backlog.front() {
        let result = with_retry(policy, op.name(), || {
            let attempt = op.apply(repository);
            async move {
                let result = attempt.await;
                if result.is_err() {
                    stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
        })
        .await;

        match result {
            Ok(()) => {
                backlog.pop_front();
                stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(
                    op = op.name(),
                    pending = backlog.len(),
                    error = %e,
                    "Persistence unavailable, deferring writes"
                );
                break;
            }
        }
    }
    stats.backlog.store(backlog.len(), Ordering::Relaxed);
    if backlog.is_empty() {
        debug!("Persistence backlog drained");
    }
}
