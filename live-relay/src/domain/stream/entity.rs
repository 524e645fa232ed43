//! Stream entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StreamState;
use crate::Error;
use crate::domain::source::SourceDescriptor;
use crate::domain::transition::{ReasonCode, TransitionRecord};

/// A live session built on one upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub name: String,
    pub source: SourceDescriptor,
    pub state: StreamState,
    /// Negotiation parameters, set once when ingestion starts.
    pub codec_params: Option<serde_json::Value>,
    pub last_fault: Option<ReasonCode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Stream {
    /// Create a stream in `Initializing` together with its creation record.
    pub fn create(name: impl Into<String>, source: SourceDescriptor) -> (Self, TransitionRecord) {
        let now = Utc::now();
        let stream = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            source,
            state: StreamState::Initializing,
            codec_params: None,
            last_fault: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        };
        let record = TransitionRecord {
            stream_id: stream.id.clone(),
            seq: 0,
            from_state: None,
            to_state: StreamState::Initializing,
            reason: ReasonCode::StreamCreated,
            detail: None,
            at: now,
        };
        (stream, record)
    }

    /// Apply a validated transition and produce its log record.
    ///
    /// `seq` is the position the record takes in this stream's log.
    pub fn apply(
        &mut self,
        to: StreamState,
        reason: ReasonCode,
        detail: Option<String>,
        seq: u64,
    ) -> Result<TransitionRecord, Error> {
        let from = self.state;
        self.state = from.transition_to(to)?;

        let now = Utc::now();
        self.updated_at = now;
        if reason.is_fault() {
            self.last_fault = Some(reason);
        }
        if to == StreamState::Live && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to == StreamState::Stopped {
            self.stopped_at = Some(now);
        }

        Ok(TransitionRecord {
            stream_id: self.id.clone(),
            seq,
            from_state: Some(from),
            to_state: to,
            reason,
            detail,
            at: now,
        })
    }

    /// Record a fault that does not change state (already in `Error`).
    pub fn note_fault(&mut self, reason: ReasonCode) {
        self.last_fault = Some(reason);
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time since the stream first went live.
    pub fn uptime(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.stopped_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::create("cam", SourceDescriptor::parse("rtsp://cam1").unwrap()).0
    }

    #[test]
    fn test_create_emits_creation_record() {
        let (stream, record) = Stream::create("cam", SourceDescriptor::parse("rtsp://cam1").unwrap());
        assert_eq!(stream.state, StreamState::Initializing);
        assert_eq!(record.seq, 0);
        assert_eq!(record.from_state, None);
        assert_eq!(record.reason, ReasonCode::StreamCreated);
        assert_eq!(record.stream_id, stream.id);
    }

    #[test]
    fn test_apply_tracks_faults_and_timestamps() {
        let mut s = stream();
        let r = s
            .apply(StreamState::Ready, ReasonCode::SourceIdentified, None, 1)
            .unwrap();
        assert_eq!(r.from_state, Some(StreamState::Initializing));
        assert!(s.last_fault.is_none());

        s.apply(StreamState::Live, ReasonCode::ThroughputConfirmed, None, 2)
            .unwrap();
        assert!(s.started_at.is_some());

        s.apply(StreamState::Error, ReasonCode::ProcessCrashed, None, 3)
            .unwrap();
        assert_eq!(s.last_fault, Some(ReasonCode::ProcessCrashed));

        s.apply(StreamState::Stopped, ReasonCode::IngestionRetryExhausted, None, 4)
            .unwrap();
        assert_eq!(s.last_fault, Some(ReasonCode::IngestionRetryExhausted));
        assert!(s.stopped_at.is_some());
        assert!(s.is_terminal());
    }

    #[test]
    fn test_apply_rejects_illegal_pair_without_mutating() {
        let mut s = stream();
        assert!(
            s.apply(StreamState::Live, ReasonCode::ThroughputConfirmed, None, 1)
                .is_err()
        );
        assert_eq!(s.state, StreamState::Initializing);
        assert!(s.started_at.is_none());
    }
}
