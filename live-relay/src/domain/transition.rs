//! Append-only transition log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::stream::StreamState;

/// Stable reason codes attached to every stream transition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReasonCode {
    StreamCreated,
    SourceIdentified,
    ThroughputConfirmed,
    ProducerRegistrationFailed,
    DiscoveryTimeout,
    ProcessCrashed,
    StalledSource,
    IngestionRetryExhausted,
    IngressFailed,
    IngestionStartFailed,
    StopRequested,
    CleanupComplete,
    Shutdown,
}

impl ReasonCode {
    /// Whether this reason describes a fault rather than normal progress.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Self::ProducerRegistrationFailed
                | Self::DiscoveryTimeout
                | Self::ProcessCrashed
                | Self::StalledSource
                | Self::IngestionRetryExhausted
                | Self::IngressFailed
                | Self::IngestionStartFailed
        )
    }
}

/// One entry of a stream's transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub stream_id: String,
    /// Position in the stream's log, starting at 0 for the creation record.
    pub seq: u64,
    pub from_state: Option<StreamState>,
    pub to_state: StreamState,
    pub reason: ReasonCode,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}
