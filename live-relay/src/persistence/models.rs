//! Row models for the SQLite repository.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC) and JSON
//! blobs as `TEXT`.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::FromRow;

use crate::domain::{
    Consumer, ConsumerState, Producer, ProducerState, ReasonCode, SourceDescriptor, Ssrc, Stream,
    StreamState, TransitionRecord,
};
use crate::{Error, Result};

#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Values outside chrono's range fall back to the epoch.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .earliest()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn corrupt(table: &str, field: &str, value: &str) -> Error {
    Error::Persistence(format!("{table}.{field} holds unrecognised value '{value}'"))
}

#[derive(Debug, Clone, FromRow)]
pub struct StreamRow {
    pub id: String,
    pub name: String,
    pub source: String,
    pub state: String,
    pub codec_params: Option<String>,
    pub last_fault: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
}

impl StreamRow {
    pub fn from_domain(stream: &Stream) -> Result<Self> {
        Ok(Self {
            id: stream.id.clone(),
            name: stream.name.clone(),
            source: stream.source.as_str().to_string(),
            state: stream.state.as_str().to_string(),
            codec_params: stream
                .codec_params
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            last_fault: stream.last_fault.map(|r| r.to_string()),
            created_at: datetime_to_ms(stream.created_at),
            updated_at: datetime_to_ms(stream.updated_at),
            started_at: stream.started_at.map(datetime_to_ms),
            stopped_at: stream.stopped_at.map(datetime_to_ms),
        })
    }

    pub fn into_domain(self) -> Result<Stream> {
        let state =
            StreamState::parse(&self.state).ok_or_else(|| corrupt("streams", "state", &self.state))?;
        let last_fault = self
            .last_fault
            .as_deref()
            .map(|r| ReasonCode::from_str(r).map_err(|_| corrupt("streams", "last_fault", r)))
            .transpose()?;
        Ok(Stream {
            id: self.id,
            name: self.name,
            source: SourceDescriptor::parse(&self.source)?,
            state,
            codec_params: self
                .codec_params
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            last_fault,
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
            started_at: self.started_at.map(ms_to_datetime),
            stopped_at: self.stopped_at.map(ms_to_datetime),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ProducerRow {
    pub id: String,
    pub stream_id: String,
    pub ingress_id: String,
    pub ssrc: i64,
    pub state: String,
    pub rtp_parameters: String,
    pub created_at: i64,
    pub closed_at: Option<i64>,
}

impl ProducerRow {
    pub fn from_domain(producer: &Producer) -> Result<Self> {
        Ok(Self {
            id: producer.id.clone(),
            stream_id: producer.stream_id.clone(),
            ingress_id: producer.ingress_id.clone(),
            ssrc: i64::from(producer.ssrc.value()),
            state: producer.state.as_str().to_string(),
            rtp_parameters: serde_json::to_string(&producer.rtp_parameters)?,
            created_at: datetime_to_ms(producer.created_at),
            closed_at: producer.closed_at.map(datetime_to_ms),
        })
    }

    pub fn into_domain(self) -> Result<Producer> {
        let state = ProducerState::parse(&self.state)
            .ok_or_else(|| corrupt("producers", "state", &self.state))?;
        let ssrc = u32::try_from(self.ssrc)
            .map_err(|_| corrupt("producers", "ssrc", &self.ssrc.to_string()))?;
        Ok(Producer {
            id: self.id,
            stream_id: self.stream_id,
            ingress_id: self.ingress_id,
            ssrc: Ssrc(ssrc),
            state,
            rtp_parameters: serde_json::from_str(&self.rtp_parameters)?,
            created_at: ms_to_datetime(self.created_at),
            closed_at: self.closed_at.map(ms_to_datetime),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ConsumerRow {
    pub id: String,
    pub stream_id: String,
    pub producer_id: String,
    pub session_id: String,
    pub client_tag: String,
    pub state: String,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub closed_at: Option<i64>,
    pub close_reason: Option<String>,
}

impl ConsumerRow {
    pub fn from_domain(consumer: &Consumer) -> Self {
        Self {
            id: consumer.id.clone(),
            stream_id: consumer.stream_id.clone(),
            producer_id: consumer.producer_id.clone(),
            session_id: consumer.session_id.clone(),
            client_tag: consumer.client_tag.clone(),
            state: consumer.state.as_str().to_string(),
            created_at: datetime_to_ms(consumer.created_at),
            last_seen_at: datetime_to_ms(consumer.last_seen_at),
            closed_at: consumer.closed_at.map(datetime_to_ms),
            close_reason: consumer.close_reason.clone(),
        }
    }

    pub fn into_domain(self) -> Result<Consumer> {
        let state = ConsumerState::parse(&self.state)
            .ok_or_else(|| corrupt("consumers", "state", &self.state))?;
        Ok(Consumer {
            id: self.id,
            stream_id: self.stream_id,
            producer_id: self.producer_id,
            session_id: self.session_id,
            client_tag: self.client_tag,
            state,
            created_at: ms_to_datetime(self.created_at),
            last_seen_at: ms_to_datetime(self.last_seen_at),
            closed_at: self.closed_at.map(ms_to_datetime),
            close_reason: self.close_reason,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TransitionRow {
    pub stream_id: String,
    pub seq: i64,
    pub from_state: Option<String>,
    pub to_state: String,
    pub reason: String,
    pub detail: Option<String>,
    pub at: i64,
}

impl TransitionRow {
    pub fn from_domain(record: &TransitionRecord) -> Self {
        Self {
            stream_id: record.stream_id.clone(),
            seq: i64::try_from(record.seq).unwrap_or(i64::MAX),
            from_state: record.from_state.map(|s| s.as_str().to_string()),
            to_state: record.to_state.as_str().to_string(),
            reason: record.reason.to_string(),
            detail: record.detail.clone(),
            at: datetime_to_ms(record.at),
        }
    }

    pub fn into_domain(self) -> Result<TransitionRecord> {
        let from_state = self
            .from_state
            .as_deref()
            .map(|s| StreamState::parse(s).ok_or_else(|| corrupt("stream_transitions", "from_state", s)))
            .transpose()?;
        let to_state = StreamState::parse(&self.to_state)
            .ok_or_else(|| corrupt("stream_transitions", "to_state", &self.to_state))?;
        let reason = ReasonCode::from_str(&self.reason)
            .map_err(|_| corrupt("stream_transitions", "reason", &self.reason))?;
        Ok(TransitionRecord {
            stream_id: self.stream_id,
            seq: u64::try_from(self.seq).unwrap_or_default(),
            from_state,
            to_state,
            reason,
            detail: self.detail,
            at: ms_to_datetime(self.at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_row_preserves_fields() {
        let (mut stream, _) = Stream::create("cam", SourceDescriptor::parse("rtsp://cam1").unwrap());
        stream.codec_params = Some(serde_json::json!({ "codec": "h264" }));
        stream.last_fault = Some(ReasonCode::StalledSource);

        let row = StreamRow::from_domain(&stream).unwrap();
        assert_eq!(row.state, "INITIALIZING");
        assert_eq!(row.last_fault.as_deref(), Some("stalled_source"));

        let back = row.into_domain().unwrap();
        assert_eq!(back.id, stream.id);
        assert_eq!(back.codec_params, stream.codec_params);
        assert_eq!(back.last_fault, Some(ReasonCode::StalledSource));
        assert_eq!(
            back.created_at.timestamp_millis(),
            stream.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_unknown_state_is_reported() {
        let row = TransitionRow {
            stream_id: "s1".into(),
            seq: 1,
            from_state: Some("INITIALIZING".into()),
            to_state: "SLEEPING".into(),
            reason: "source_identified".into(),
            detail: None,
            at: 0,
        };
        let err = row.into_domain().unwrap_err();
        assert_eq!(err.code(), "persistence_unavailable");
    }

    #[test]
    fn test_ssrc_above_i32_is_kept() {
        let producer = Producer {
            id: "p1".into(),
            stream_id: "s1".into(),
            ingress_id: "i1".into(),
            ssrc: Ssrc(0xdead_beef),
            state: ProducerState::Active,
            rtp_parameters: serde_json::json!({}),
            created_at: Utc::now(),
            closed_at: None,
        };
        let back = ProducerRow::from_domain(&producer)
            .unwrap()
            .into_domain()
            .unwrap();
        assert_eq!(back.ssrc, Ssrc(0xdead_beef));
    }
}
