//! Ingest engine trait and launch types.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::domain::SourceDescriptor;

/// Everything an engine needs to launch one process generation.
#[derive(Debug, Clone)]
pub struct IngestLaunch {
    pub stream_id: String,
    /// Incremented on every launch of the same stream.
    pub generation: u64,
    pub source: SourceDescriptor,
    /// Where the real-time RTP output must be sent.
    pub rtp_target: SocketAddr,
    /// Directory for archival output; created before launch.
    pub archive_dir: PathBuf,
}

/// How a process generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub description: String,
    /// The exit followed a stop request rather than happening on its own.
    pub requested: bool,
}

impl ProcessExit {
    pub fn requested(description: impl Into<String>) -> Self {
        Self {
            code: None,
            description: description.into(),
            requested: true,
        }
    }
}

/// A running process generation.
///
/// Cancelling the token asks the engine to stop the process; the exit is
/// always reported through `exit`.
pub struct IngestProcess {
    pub pid: Option<u32>,
    pub exit: oneshot::Receiver<ProcessExit>,
    cancel: CancellationToken,
}

impl IngestProcess {
    pub fn new(
        pid: Option<u32>,
        exit: oneshot::Receiver<ProcessExit>,
        cancel: CancellationToken,
    ) -> Self {
        Self { pid, exit, cancel }
    }

    /// Request termination. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for IngestProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Launches ingestion processes.
#[async_trait]
pub trait IngestEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Launch one process generation.
    async fn launch(&self, launch: IngestLaunch) -> Result<IngestProcess>;

    /// Check if the engine can run (e.g. the binary exists).
    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        None
    }
}
