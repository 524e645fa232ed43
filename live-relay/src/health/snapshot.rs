//! Health snapshot types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ReasonCode, Stream, StreamState};
use crate::ingest::IngestLiveness;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl HealthStatus {
    /// Status of one stream from its state and ingestion liveness.
    pub fn classify(state: StreamState, liveness: Option<&IngestLiveness>) -> Self {
        if state.is_terminal() {
            return Self::Unknown;
        }
        if liveness.is_some_and(|l| l.stalled || l.exhausted) {
            return Self::Unhealthy;
        }
        match state {
            StreamState::Live if liveness.is_some_and(|l| l.alive) => Self::Healthy,
            StreamState::Live => Self::Unhealthy,
            _ => Self::Degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHealth {
    pub stream_id: String,
    pub name: String,
    pub state: StreamState,
    pub status: HealthStatus,
    /// Seconds since the stream first went live.
    pub uptime_secs: Option<i64>,
    pub bytes_per_sec: u64,
    pub bytes: u64,
    pub packets: u64,
    pub idle_ms: Option<u64>,
    pub restarts: u64,
    pub consumers: usize,
    pub last_fault: Option<ReasonCode>,
    pub checked_at: DateTime<Utc>,
}

impl StreamHealth {
    pub fn build(stream: &Stream, liveness: Option<&IngestLiveness>, consumers: usize) -> Self {
        Self {
            stream_id: stream.id.clone(),
            name: stream.name.clone(),
            state: stream.state,
            status: HealthStatus::classify(stream.state, liveness),
            uptime_secs: stream.uptime().map(|d| d.num_seconds()),
            bytes_per_sec: liveness.map_or(0, |l| l.bytes_per_sec),
            bytes: liveness.map_or(0, |l| l.bytes),
            packets: liveness.map_or(0, |l| l.packets),
            idle_ms: liveness.map(|l| l.idle_ms),
            restarts: liveness.map_or(0, |l| l.restarts),
            consumers,
            last_fault: stream.last_fault,
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub status: HealthStatus,
    pub streams: usize,
    pub by_state: BTreeMap<String, usize>,
    pub total_consumers: usize,
    pub total_bytes_per_sec: u64,
    pub uptime_secs: u64,
    pub checked_at: DateTime<Utc>,
}

impl AggregateHealth {
    /// Healthy when every active stream is healthy; degraded otherwise.
    pub fn from_streams<'a>(
        streams: impl IntoIterator<Item = &'a StreamHealth>,
        uptime_secs: u64,
    ) -> Self {
        let mut by_state = BTreeMap::new();
        let mut count = 0;
        let mut total_consumers = 0;
        let mut total_bytes_per_sec = 0;
        let mut status = HealthStatus::Healthy;

        for health in streams {
            count += 1;
            *by_state.entry(health.state.to_string()).or_insert(0) += 1;
            if health.state.is_terminal() {
                continue;
            }
            total_consumers += health.consumers;
            total_bytes_per_sec += health.bytes_per_sec;
            if health.status != HealthStatus::Healthy {
                status = HealthStatus::Degraded;
            }
        }

        Self {
            status,
            streams: count,
            by_state,
            total_consumers,
            total_bytes_per_sec,
            uptime_secs,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn liveness(alive: bool, stalled: bool, exhausted: bool) -> IngestLiveness {
        IngestLiveness {
            alive,
            pid: Some(1),
            generation: 1,
            ssrc: None,
            restarts: 0,
            bytes: 1_000,
            packets: 10,
            bytes_per_sec: 500,
            idle_ms: 0,
            stalled,
            exhausted,
        }
    }

    #[rstest]
    #[case(StreamState::Live, Some((true, false, false)), HealthStatus::Healthy)]
    #[case(StreamState::Live, Some((true, true, false)), HealthStatus::Unhealthy)]
    #[case(StreamState::Live, None, HealthStatus::Unhealthy)]
    #[case(StreamState::Initializing, Some((true, false, false)), HealthStatus::Degraded)]
    #[case(StreamState::Ready, None, HealthStatus::Degraded)]
    #[case(StreamState::Error, Some((false, false, true)), HealthStatus::Unhealthy)]
    #[case(StreamState::Error, Some((false, false, false)), HealthStatus::Degraded)]
    #[case(StreamState::Stopped, Some((true, true, false)), HealthStatus::Unknown)]
    #[case(StreamState::Closed, None, HealthStatus::Unknown)]
    fn test_classify(
        #[case] state: StreamState,
        #[case] flags: Option<(bool, bool, bool)>,
        #[case] expected: HealthStatus,
    ) {
        let live = flags.map(|(a, s, e)| liveness(a, s, e));
        assert_eq!(HealthStatus::classify(state, live.as_ref()), expected);
    }

    #[test]
    fn test_aggregate_counts_active_streams_only() {
        let source = crate::domain::SourceDescriptor::parse("rtsp://cam1").unwrap();
        let (mut live, _) = Stream::create("a", source.clone());
        live.state = StreamState::Live;
        let (mut closed, _) = Stream::create("b", source);
        closed.state = StreamState::Closed;

        let healthy = liveness(true, false, false);
        let streams = [
            StreamHealth::build(&live, Some(&healthy), 2),
            StreamHealth::build(&closed, None, 0),
        ];
        let aggregate = AggregateHealth::from_streams(&streams, 5);

        assert_eq!(aggregate.status, HealthStatus::Healthy);
        assert_eq!(aggregate.streams, 2);
        assert_eq!(aggregate.by_state.get("LIVE"), Some(&1));
        assert_eq!(aggregate.by_state.get("CLOSED"), Some(&1));
        assert_eq!(aggregate.total_consumers, 2);
        assert_eq!(aggregate.total_bytes_per_sec, 500);
    }
}
