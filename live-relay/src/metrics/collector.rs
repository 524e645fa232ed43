//! Metrics collector implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerStats;
use crate::domain::{ReasonCode, StreamState};

/// Per-stream gauges refreshed on every sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamGauges {
    pub uptime_secs: u64,
    pub bytes_per_sec: u64,
    pub restarts: u64,
    pub consumers: u64,
    /// Mean lifetime of closed viewer sessions.
    pub average_session_ms: u64,
}

/// Metrics collector for the relay.
#[derive(Debug)]
pub struct MetricsCollector {
    // Stream metrics
    streams_by_state: DashMap<String, AtomicU64>,
    producers_active: AtomicU64,
    stream_faults: DashMap<String, AtomicU64>,
    streams_evicted: AtomicU64,
    sweeps: AtomicU64,

    // Ingest metrics
    ingest_processes: AtomicU64,
    ingest_processes_healthy: AtomicU64,

    // Consumer metrics
    consumers_connecting: AtomicU64,
    consumers_connected: AtomicU64,
    consumers_closed: AtomicU64,

    streams: DashMap<String, StreamGauges>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            streams_by_state: StreamState::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), AtomicU64::new(0)))
                .collect(),
            producers_active: AtomicU64::new(0),
            stream_faults: DashMap::new(),
            streams_evicted: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            ingest_processes: AtomicU64::new(0),
            ingest_processes_healthy: AtomicU64::new(0),
            consumers_connecting: AtomicU64::new(0),
            consumers_connected: AtomicU64::new(0),
            consumers_closed: AtomicU64::new(0),
            streams: DashMap::new(),
        }
    }

    // ========== Stream Metrics ==========

    /// Replace the per-state stream counts. States absent from `counts`
    /// drop to zero.
    pub fn set_streams_by_state(&self, counts: &HashMap<StreamState, u64>) {
        for state in StreamState::ALL {
            let count = counts.get(&state).copied().unwrap_or(0);
            self.streams_by_state
                .entry(state.as_str().to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .store(count, Ordering::Relaxed);
        }
    }

    pub fn set_producers_active(&self, count: u64) {
        self.producers_active.store(count, Ordering::Relaxed);
    }

    /// Record a fault reported by the health sweep.
    pub fn record_fault(&self, reason: ReasonCode) {
        self.stream_faults
            .entry(reason.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    // ========== Ingest Metrics ==========

    pub fn set_ingest_processes(&self, alive: u64, healthy: u64) {
        self.ingest_processes.store(alive, Ordering::Relaxed);
        self.ingest_processes_healthy
            .store(healthy, Ordering::Relaxed);
    }

    // ========== Consumer Metrics ==========

    /// Replace the consumer totals with the sum of per-stream stats.
    pub fn set_consumer_totals(&self, stats: &ConsumerStats) {
        self.consumers_connecting
            .store(stats.connecting as u64, Ordering::Relaxed);
        self.consumers_connected
            .store(stats.connected as u64, Ordering::Relaxed);
        self.consumers_closed.store(stats.closed, Ordering::Relaxed);
    }

    // ========== Per-stream Gauges ==========

    pub fn set_stream(&self, stream_id: impl Into<String>, gauges: StreamGauges) {
        self.streams.insert(stream_id.into(), gauges);
    }

    /// Forget a stream that left memory.
    pub fn remove_stream(&self, stream_id: &str) {
        self.streams.remove(stream_id);
        self.streams_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream(&self, stream_id: &str) -> Option<StreamGauges> {
        self.streams.get(stream_id).map(|g| *g)
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_by_state: collect_counts(&self.streams_by_state),
            producers_active: self.producers_active.load(Ordering::Relaxed),
            stream_faults: collect_counts(&self.stream_faults),
            streams_evicted: self.streams_evicted.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            ingest_processes: self.ingest_processes.load(Ordering::Relaxed),
            ingest_processes_healthy: self
                .ingest_processes_healthy
                .load(Ordering::Relaxed),
            consumers_connecting: self.consumers_connecting.load(Ordering::Relaxed),
            consumers_connected: self.consumers_connected.load(Ordering::Relaxed),
            consumers_closed: self.consumers_closed.load(Ordering::Relaxed),
            streams: self
                .streams
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_counts(map: &DashMap<String, AtomicU64>) -> HashMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    // Stream metrics
    pub streams_by_state: HashMap<String, u64>,
    pub producers_active: u64,
    pub stream_faults: HashMap<String, u64>,
    pub streams_evicted: u64,
    pub sweeps: u64,

    // Ingest metrics
    pub ingest_processes: u64,
    pub ingest_processes_healthy: u64,

    // Consumer metrics
    pub consumers_connecting: u64,
    pub consumers_connected: u64,
    pub consumers_closed: u64,

    pub streams: HashMap<String, StreamGauges>,
}
