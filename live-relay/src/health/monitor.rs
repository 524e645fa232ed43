//! Periodic per-stream health sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::snapshot::{AggregateHealth, HealthStatus, StreamHealth};
use crate::config::HealthConfig;
use crate::consumer::ConsumerStats;
use crate::controller::StreamController;
use crate::domain::{ReasonCode, StreamState};
use crate::metrics::{MetricsCollector, StreamGauges};

pub struct HealthMonitor {
    controller: Arc<StreamController>,
    config: HealthConfig,
    metrics: Arc<MetricsCollector>,
    latest: DashMap<String, StreamHealth>,
    events: broadcast::Sender<StreamHealth>,
    started: Instant,
}

impl HealthMonitor {
    pub fn new(
        controller: Arc<StreamController>,
        config: HealthConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            controller,
            config,
            metrics,
            latest: DashMap::new(),
            events,
            started: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamHealth> {
        self.events.subscribe()
    }

    /// Current health of one stream, computed on demand.
    pub fn stream_health(&self, stream_id: &str) -> Option<StreamHealth> {
        let stream = self.controller.snapshot(stream_id)?;
        let liveness = self.controller.supervisor().liveness(stream_id);
        let consumers = self.controller.registry().count(stream_id);
        Some(StreamHealth::build(&stream, liveness.as_ref(), consumers))
    }

    /// Last snapshot published by the sweep.
    pub fn last_published(&self, stream_id: &str) -> Option<StreamHealth> {
        self.latest.get(stream_id).map(|h| h.clone())
    }

    pub fn aggregate(&self) -> AggregateHealth {
        let streams: Vec<StreamHealth> = self
            .controller
            .stream_ids()
            .iter()
            .filter_map(|id| self.stream_health(id))
            .collect();
        AggregateHealth::from_streams(&streams, self.started.elapsed().as_secs())
    }

    /// Run one pass over every stream. Stalled or exhausted ingestion is
    /// reported to the controller as a fault; faults for different streams
    /// are dispatched together.
    pub async fn sweep(&self) -> Vec<StreamHealth> {
        for stream_id in self.controller.evict_closed().await {
            self.latest.remove(&stream_id);
            self.metrics.remove_stream(&stream_id);
        }

        let faults: Vec<_> = self
            .controller
            .stream_ids()
            .into_iter()
            .filter_map(move |stream_id| {
                let (reason, detail) = self.detect_fault(&stream_id)?;
                warn!(stream_id = %stream_id, reason = %reason, detail = %detail, "Ingestion fault detected");
                self.metrics.record_fault(reason);
                Some(async move {
                    if let Err(e) = self.controller.fault(&stream_id, reason, Some(detail)).await {
                        warn!(stream_id = %stream_id, error = %e, "Failed to report fault");
                    }
                })
            })
            .collect();
        join_all(faults).await;

        let mut published = Vec::new();
        let mut observed = Vec::new();
        for stream_id in self.controller.stream_ids() {
            let Some(health) = self.stream_health(&stream_id) else {
                continue;
            };
            observed.push(health.clone());
            let previous = self.latest.insert(stream_id.clone(), health.clone());

            // Terminal streams are published once.
            if health.status == HealthStatus::Unknown
                && previous.as_ref().is_some_and(|p| p.state == health.state)
            {
                continue;
            }
            if previous.is_none_or(|p| p.status != health.status) {
                debug!(stream_id = %stream_id, status = %health.status, "Stream health changed");
            }
            let _ = self.events.send(health.clone());
            published.push(health);
        }

        self.record_metrics(&observed);
        published
    }

    fn detect_fault(&self, stream_id: &str) -> Option<(ReasonCode, String)> {
        let stream = self.controller.snapshot(stream_id)?;
        if stream.is_terminal() {
            return None;
        }
        let live = self.controller.supervisor().liveness(stream_id)?;
        if live.exhausted {
            Some((ReasonCode::IngestionRetryExhausted, "restart budget spent".to_string()))
        } else if live.stalled && matches!(stream.state, StreamState::Ready | StreamState::Live) {
            Some((ReasonCode::StalledSource, format!("no packets for {}ms", live.idle_ms)))
        } else {
            None
        }
    }

    fn record_metrics(&self, observed: &[StreamHealth]) {
        let registry = self.controller.registry();
        let mut states: HashMap<StreamState, u64> = HashMap::new();
        let mut totals = ConsumerStats::default();
        let mut producers = 0;
        let mut alive = 0;
        let mut healthy = 0;

        for health in observed {
            *states.entry(health.state).or_default() += 1;
            if self
                .controller
                .producer(&health.stream_id)
                .is_some_and(|p| p.is_active())
            {
                producers += 1;
            }
            if self
                .controller
                .supervisor()
                .liveness(&health.stream_id)
                .is_some_and(|l| l.alive)
            {
                alive += 1;
                if health.status != HealthStatus::Unhealthy {
                    healthy += 1;
                }
            }

            let stats = registry.stats(&health.stream_id);
            totals.connecting += stats.connecting;
            totals.connected += stats.connected;
            totals.closed += stats.closed;
            self.metrics.set_stream(
                health.stream_id.clone(),
                StreamGauges {
                    uptime_secs: health.uptime_secs.map_or(0, |s| s.max(0) as u64),
                    bytes_per_sec: health.bytes_per_sec,
                    restarts: health.restarts,
                    consumers: (stats.connecting + stats.connected) as u64,
                    average_session_ms: stats.average_session_ms,
                },
            );
        }

        self.metrics.set_streams_by_state(&states);
        self.metrics.set_producers_active(producers);
        self.metrics.set_ingest_processes(alive, healthy);
        self.metrics.set_consumer_totals(&totals);
        self.metrics.record_sweep();
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = self.config.interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(interval_ms = interval.as_millis() as u64, "Health monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.sweep().await;
                    }
                }
            }
        })
    }
}
