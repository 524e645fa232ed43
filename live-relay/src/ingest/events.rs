//! Events sent from the supervisor to a stream's controller.

use crate::domain::Ssrc;

/// Why a process generation ended without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Crashed(String),
    DiscoveryTimeout,
    LaunchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    /// A new process generation was launched.
    Started { generation: u64, pid: Option<u32> },
    /// The first RTP packet of `generation` carried `ssrc`.
    SourceIdentified { generation: u64, ssrc: Ssrc },
    /// Periodic counters for the current generation.
    Throughput {
        generation: u64,
        bytes: u64,
        packets: u64,
        bytes_per_sec: u64,
    },
    /// A generation failed. When `will_restart` is false a
    /// [`RetryExhausted`](IngestEvent::RetryExhausted) follows.
    Failed {
        generation: u64,
        kind: FailureKind,
        will_restart: bool,
    },
    /// The restart budget is spent; the supervisor has given up.
    RetryExhausted { failures: usize },
}

impl IngestEvent {
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Started { generation, .. }
            | Self::SourceIdentified { generation, .. }
            | Self::Throughput { generation, .. }
            | Self::Failed { generation, .. } => Some(*generation),
            Self::RetryExhausted { .. } => None,
        }
    }
}
