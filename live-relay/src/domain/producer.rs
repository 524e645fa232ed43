//! Producer entity: the routing boundary's handle on a stream's media.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::source::Ssrc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerState {
    Creating,
    Active,
    Closed,
}

impl ProducerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    /// Identifier issued by the routing boundary.
    pub id: String,
    pub stream_id: String,
    pub ingress_id: String,
    pub ssrc: Ssrc,
    pub state: ProducerState,
    /// RTP parameters as echoed back by the boundary.
    pub rtp_parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Producer {
    pub fn is_active(&self) -> bool {
        self.state == ProducerState::Active
    }

    pub fn mark_closed(&mut self) {
        if self.state != ProducerState::Closed {
            self.state = ProducerState::Closed;
            self.closed_at = Some(Utc::now());
        }
    }
}
