//! Consumer session registry.
//!
//! Consumers are grouped into per-stream buckets, each behind its own lock,
//! with a consumer-to-stream index for lookups by consumer id. A bucket is
//! bound to the producer consumers may attach to; closing a bucket rejects
//! later inserts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::domain::consumer::close_reason;
use crate::domain::{Consumer, ConsumerState};
use crate::{Error, Result};

/// Releases the boundary-side session of an evicted consumer.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close_session(&self, consumer: &Consumer) -> Result<()>;
}

/// Per-stream consumer counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumerStats {
    pub connecting: usize,
    pub connected: usize,
    pub closed: u64,
    /// Mean lifetime of closed sessions.
    pub average_session_ms: u64,
}

#[derive(Debug)]
struct ConsumerEntry {
    consumer: Consumer,
    created: Instant,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Bucket {
    producer_id: Option<String>,
    closed: bool,
    consumers: HashMap<String, ConsumerEntry>,
    closed_count: u64,
    closed_duration: Duration,
}

impl Bucket {
    fn take(&mut self, consumer_id: &str, reason: &str) -> Option<Consumer> {
        let entry = self.consumers.remove(consumer_id)?;
        self.closed_count += 1;
        self.closed_duration += entry.created.elapsed();
        let mut consumer = entry.consumer;
        consumer.close(reason);
        Some(consumer)
    }
}

pub struct ConsumerSessionRegistry {
    config: ConsumerConfig,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    index: DashMap<String, String>,
}

impl ConsumerSessionRegistry {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            index: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn bucket(&self, stream_id: &str) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.get(stream_id).map(|b| b.value().clone())
    }

    fn bucket_of(&self, consumer_id: &str) -> Result<Arc<Mutex<Bucket>>> {
        let stream_id = self
            .index
            .get(consumer_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::not_found("Consumer", consumer_id))?;
        self.bucket(&stream_id)
            .ok_or_else(|| Error::not_found("Consumer", consumer_id))
    }

    /// Bind a stream's bucket to `producer_id`, creating it if needed.
    pub fn open_stream(&self, stream_id: &str, producer_id: &str) {
        let bucket = self
            .buckets
            .entry(stream_id.to_string())
            .or_default()
            .value()
            .clone();
        let mut bucket = bucket.lock();
        bucket.closed = false;
        bucket.producer_id = Some(producer_id.to_string());
    }

    /// Add a consumer attached to the stream's current producer.
    pub fn insert(&self, consumer: Consumer) -> Result<()> {
        let not_live = || Error::StreamNotLive {
            stream_id: consumer.stream_id.clone(),
            state: "no active producer".to_string(),
        };
        let bucket = self.bucket(&consumer.stream_id).ok_or_else(not_live)?;
        let mut bucket = bucket.lock();

        if bucket.closed || bucket.producer_id.as_deref() != Some(consumer.producer_id.as_str()) {
            return Err(not_live());
        }

        let now = Instant::now();
        self.index
            .insert(consumer.id.clone(), consumer.stream_id.clone());
        bucket.consumers.insert(
            consumer.id.clone(),
            ConsumerEntry {
                consumer,
                created: now,
                last_seen: now,
            },
        );
        Ok(())
    }

    pub fn get(&self, consumer_id: &str) -> Option<Consumer> {
        let bucket = self.bucket_of(consumer_id).ok()?;
        let bucket = bucket.lock();
        bucket
            .consumers
            .get(consumer_id)
            .map(|e| e.consumer.clone())
    }

    /// Refresh a consumer's liveness.
    pub fn record_heartbeat(&self, consumer_id: &str) -> Result<Consumer> {
        let bucket = self.bucket_of(consumer_id)?;
        let mut bucket = bucket.lock();
        let entry = bucket
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| Error::not_found("Consumer", consumer_id))?;
        entry.last_seen = Instant::now();
        entry.consumer.last_seen_at = Utc::now();
        Ok(entry.consumer.clone())
    }

    /// `connecting -> connected`. Already connected consumers are returned
    /// unchanged.
    pub fn mark_connected(&self, consumer_id: &str) -> Result<Consumer> {
        let bucket = self.bucket_of(consumer_id)?;
        let mut bucket = bucket.lock();
        let entry = bucket
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| Error::not_found("Consumer", consumer_id))?;
        if entry.consumer.state == ConsumerState::Connecting {
            entry.consumer.state = ConsumerState::Connected;
            entry.last_seen = Instant::now();
            entry.consumer.last_seen_at = Utc::now();
        }
        Ok(entry.consumer.clone())
    }

    /// Remove a consumer, returning it closed. `None` if it was not present.
    pub fn remove(&self, consumer_id: &str, reason: &str) -> Option<Consumer> {
        let bucket = self.bucket_of(consumer_id).ok()?;
        let removed = bucket.lock().take(consumer_id, reason);
        if removed.is_some() {
            self.index.remove(consumer_id);
        }
        removed
    }

    /// Forced eviction.
    pub fn force_close(&self, consumer_id: &str, reason: &str) -> Result<Consumer> {
        let consumer = self
            .remove(consumer_id, reason)
            .ok_or_else(|| Error::not_found("Consumer", consumer_id))?;
        info!(consumer_id = %consumer_id, stream_id = %consumer.stream_id, reason, "Consumer force-closed");
        Ok(consumer)
    }

    /// Close consumers attached to `producer_id` and unbind the bucket until
    /// the next [`open_stream`](Self::open_stream).
    pub fn close_producer_consumers(
        &self,
        stream_id: &str,
        producer_id: &str,
        reason: &str,
    ) -> Vec<Consumer> {
        let Some(bucket) = self.bucket(stream_id) else {
            return Vec::new();
        };
        let closed = {
            let mut bucket = bucket.lock();
            if bucket.producer_id.as_deref() == Some(producer_id) {
                bucket.producer_id = None;
            }
            let ids: Vec<String> = bucket
                .consumers
                .values()
                .filter(|e| e.consumer.producer_id == producer_id)
                .map(|e| e.consumer.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| bucket.take(id, reason))
                .collect::<Vec<_>>()
        };
        for consumer in &closed {
            self.index.remove(&consumer.id);
        }
        closed
    }

    /// Close every consumer of a stream and reject later inserts.
    pub fn close_stream(&self, stream_id: &str, reason: &str) -> Vec<Consumer> {
        let Some((_, bucket)) = self.buckets.remove(stream_id) else {
            return Vec::new();
        };
        let closed = {
            let mut bucket = bucket.lock();
            bucket.closed = true;
            bucket.producer_id = None;
            let ids: Vec<String> = bucket.consumers.keys().cloned().collect();
            ids.iter()
                .filter_map(|id| bucket.take(id, reason))
                .collect::<Vec<_>>()
        };
        for consumer in &closed {
            self.index.remove(&consumer.id);
        }
        if !closed.is_empty() {
            debug!(stream_id = %stream_id, count = closed.len(), reason, "Closed stream consumers");
        }
        closed
    }

    pub fn list(&self, stream_id: &str) -> Vec<Consumer> {
        let Some(bucket) = self.bucket(stream_id) else {
            return Vec::new();
        };
        let bucket = bucket.lock();
        let mut consumers: Vec<Consumer> =
            bucket.consumers.values().map(|e| e.consumer.clone()).collect();
        consumers.sort_by_key(|c| c.created_at);
        consumers
    }

    pub fn count(&self, stream_id: &str) -> usize {
        self.bucket(stream_id)
            .map(|b| b.lock().consumers.len())
            .unwrap_or(0)
    }

    pub fn total_count(&self) -> usize {
        self.index.len()
    }

    pub fn stats(&self, stream_id: &str) -> ConsumerStats {
        let Some(bucket) = self.bucket(stream_id) else {
            return ConsumerStats::default();
        };
        let bucket = bucket.lock();
        let mut stats = ConsumerStats {
            closed: bucket.closed_count,
            ..Default::default()
        };
        for entry in bucket.consumers.values() {
            match entry.consumer.state {
                ConsumerState::Connecting => stats.connecting += 1,
                ConsumerState::Connected => stats.connected += 1,
                ConsumerState::Closed => {}
            }
        }
        if bucket.closed_count > 0 {
            stats.average_session_ms =
                (bucket.closed_duration.as_millis() / bucket.closed_count as u128) as u64;
        }
        stats
    }

    /// Remove consumers whose heartbeat or handshake window has elapsed.
    pub fn sweep_expired(&self) -> Vec<Consumer> {
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let handshake_timeout = self.config.handshake_timeout();
        let buckets: Vec<Arc<Mutex<Bucket>>> =
            self.buckets.iter().map(|b| b.value().clone()).collect();

        let mut expired = Vec::new();
        for bucket in buckets {
            let mut bucket = bucket.lock();
            let now = Instant::now();
            let stale: Vec<(String, &'static str)> = bucket
                .consumers
                .values()
                .filter_map(|e| {
                    if e.consumer.state == ConsumerState::Connecting
                        && now.duration_since(e.created) >= handshake_timeout
                    {
                        Some((e.consumer.id.clone(), close_reason::HANDSHAKE_TIMEOUT))
                    } else if now.duration_since(e.last_seen) >= heartbeat_timeout {
                        Some((e.consumer.id.clone(), close_reason::HEARTBEAT_TIMEOUT))
                    } else {
                        None
                    }
                })
                .collect();
            for (id, reason) in stale {
                if let Some(consumer) = bucket.take(&id, reason) {
                    expired.push(consumer);
                }
            }
        }

        for consumer in &expired {
            self.index.remove(&consumer.id);
        }
        expired
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every sweep interval and
    /// release evicted sessions through `closer`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        closer: Arc<dyn SessionCloser>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Consumer sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        for consumer in registry.sweep_expired() {
                            info!(
                                consumer_id = %consumer.id,
                                stream_id = %consumer.stream_id,
                                reason = consumer.close_reason.as_deref().unwrap_or_default(),
                                "Evicted consumer"
                            );
                            if let Err(e) = closer.close_session(&consumer).await {
                                warn!(consumer_id = %consumer.id, error = %e, "Failed to close evicted session");
                            }
                        }
                    }
                }
            }
        })
    }
}
