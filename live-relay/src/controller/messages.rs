//! Commands accepted by a stream actor.

use serde::Serialize;
use tokio::sync::oneshot;

use crate::Result;
use crate::domain::{ReasonCode, Ssrc, Stream};

#[derive(Debug)]
pub enum StreamCommand {
    /// Register the producer for `ssrc` and move to `Ready`.
    AdvanceToReady {
        ssrc: Ssrc,
        reply: oneshot::Sender<Result<Stream>>,
    },
    /// Report a fault observed outside the actor.
    Fault {
        reason: ReasonCode,
        detail: Option<String>,
        reply: oneshot::Sender<Result<Stream>>,
    },
    /// Retry a stream left in `Error` without ingestion: create a fresh
    /// ingress and start ingestion again.
    Reconnect {
        reply: oneshot::Sender<Result<Stream>>,
    },
    /// Tear the stream down. `reason` is recorded on the `Stopped` entry.
    Stop {
        reason: ReasonCode,
        reply: oneshot::Sender<Result<Stream>>,
    },
}

/// Result of a create request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub stream: Stream,
    /// True when an active stream for the same source was returned.
    pub reused: bool,
}
