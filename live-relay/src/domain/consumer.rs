//! Consumer entity: one viewer attachment to a stream's producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Connecting,
    Connected,
    Closed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Close reasons recorded on consumers.
pub mod close_reason {
    pub const DETACHED: &str = "detached";
    pub const EVICTED: &str = "evicted";
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
    pub const HANDSHAKE_TIMEOUT: &str = "handshake_timeout";
    pub const HANDSHAKE_FAILED: &str = "handshake_failed";
    pub const PRODUCER_REPLACED: &str = "producer_replaced";
    pub const STREAM_STOPPED: &str = "stream_stopped";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    pub id: String,
    pub stream_id: String,
    pub producer_id: String,
    /// Egress session identifier issued by the routing boundary.
    pub session_id: String,
    pub client_tag: String,
    pub state: ConsumerState,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl Consumer {
    pub fn close(&mut self, reason: impl Into<String>) {
        if self.state != ConsumerState::Closed {
            let now = Utc::now();
            self.state = ConsumerState::Closed;
            self.closed_at = Some(now);
            self.close_reason = Some(reason.into());
        }
    }
}
