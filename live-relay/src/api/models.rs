//! API request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StreamPolicy;
use crate::consumer::ConsumerStats;
use crate::ingest::IngestionHandle;
use crate::domain::{Producer, ProducerState, ReasonCode, Ssrc, Stream, StreamState};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateStreamRequest {
    pub source: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub policy: StreamPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamFilterParams {
    /// Filter by state, e.g. `LIVE` or `live`.
    pub state: Option<String>,
}

impl StreamFilterParams {
    pub fn parse_state(&self) -> Result<Option<StreamState>, String> {
        match self.state.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => StreamState::parse(&raw.to_ascii_uppercase())
                .map(Some)
                .ok_or_else(|| format!("unknown stream state '{raw}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSummary {
    pub id: String,
    pub ssrc: Ssrc,
    pub state: ProducerState,
    pub created_at: DateTime<Utc>,
}

impl From<&Producer> for ProducerSummary {
    fn from(producer: &Producer) -> Self {
        Self {
            id: producer.id.clone(),
            ssrc: producer.ssrc,
            state: producer.state,
            created_at: producer.created_at,
        }
    }
}

/// A stream as exposed over the API. Source credentials are never included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
    pub id: String,
    pub name: String,
    pub source: String,
    pub state: StreamState,
    pub last_fault: Option<ReasonCode>,
    pub producer: Option<ProducerSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl StreamResponse {
    pub fn new(stream: &Stream, producer: Option<&Producer>) -> Self {
        Self {
            id: stream.id.clone(),
            name: stream.name.clone(),
            source: stream.source.redacted(),
            state: stream.state,
            last_fault: stream.last_fault,
            producer: producer.map(ProducerSummary::from),
            created_at: stream.created_at,
            updated_at: stream.updated_at,
            started_at: stream.started_at,
            stopped_at: stream.stopped_at,
        }
    }
}

/// Ingestion counters, producer and viewer session statistics for one
/// stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatsResponse {
    pub stream_id: String,
    pub state: StreamState,
    pub ingestion: Option<IngestionHandle>,
    pub producer: Option<ProducerSummary>,
    pub consumers: ConsumerStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStreamResponse {
    #[serde(flatten)]
    pub stream: StreamResponse,
    pub reused: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachConsumerRequest {
    #[serde(default)]
    pub client_tag: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectConsumerRequest {
    /// Transport parameters from the viewer, forwarded to the boundary.
    pub handshake: Value,
}
