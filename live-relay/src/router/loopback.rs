//! In-process routing boundary.
//!
//! Ingress endpoints are real loopback UDP sockets. Every SSRC seen on an
//! ingress is recorded, and producer registration is rejected for an SSRC
//! that never arrived.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::boundary::{
    EgressRequest, EgressSession, IngressEndpoint, ProducerRegistration, RegisteredProducer,
    RoutingBoundary,
};
use crate::domain::Ssrc;
use crate::ingest::rtp::peek_ssrc;
use crate::{Error, Result};

struct LoopbackIngress {
    addr: SocketAddr,
    observed: Mutex<HashSet<Ssrc>>,
    packets: AtomicU64,
    notify: Notify,
    cancel: CancellationToken,
}

impl LoopbackIngress {
    fn has_observed(&self, ssrc: Ssrc) -> bool {
        self.observed.lock().contains(&ssrc)
    }
}

#[derive(Debug, Clone)]
struct ProducerRecord {
    ingress_id: String,
    ssrc: Ssrc,
    closed: bool,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    producer_id: String,
    connected: bool,
}

pub struct LoopbackBoundary {
    observe_grace: Duration,
    ingresses: DashMap<String, Arc<LoopbackIngress>>,
    producers: DashMap<String, ProducerRecord>,
    sessions: DashMap<String, SessionRecord>,
    reject_registrations: AtomicBool,
    close_delay_ms: AtomicU64,
}

impl LoopbackBoundary {
    pub fn new(observe_grace: Duration) -> Self {
        Self {
            observe_grace,
            ingresses: DashMap::new(),
            producers: DashMap::new(),
            sessions: DashMap::new(),
            reject_registrations: AtomicBool::new(false),
            close_delay_ms: AtomicU64::new(0),
        }
    }

    /// Refuse every producer registration until reset, the way a router
    /// does when it is out of capacity.
    pub fn set_reject_registrations(&self, reject: bool) {
        self.reject_registrations.store(reject, Ordering::Relaxed);
    }

    /// Delay every producer close, the way a loaded router answers slowly.
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn is_producer_active(&self, producer_id: &str) -> bool {
        self.producers
            .get(producer_id)
            .map(|p| !p.closed)
            .unwrap_or(false)
    }

    pub fn active_producer_count(&self) -> usize {
        self.producers.iter().filter(|p| !p.closed).count()
    }

    /// Every producer id ever issued.
    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.iter().map(|p| p.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connected_session_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.connected).count()
    }

    pub fn ingress_count(&self) -> usize {
        self.ingresses.len()
    }

    pub fn ingress_packets(&self, ingress_id: &str) -> u64 {
        self.ingresses
            .get(ingress_id)
            .map(|i| i.packets.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn wait_observed(&self, ingress: &LoopbackIngress, ssrc: Ssrc) -> bool {
        let deadline = tokio::time::Instant::now() + self.observe_grace;
        loop {
            let notified = ingress.notify.notified();
            if ingress.has_observed(ssrc) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return ingress.has_observed(ssrc);
            }
        }
    }
}

async fn receive(socket: UdpSocket, ingress: Arc<LoopbackIngress>) {
    let mut buf = vec![0u8; 65_535];
    loop {
        let len = tokio::select! {
            _ = ingress.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => len,
                Err(e) => {
                    trace!(error = %e, "Loopback ingress receive error");
                    continue;
                }
            },
        };
        if let Some(ssrc) = peek_ssrc(&buf[..len]) {
            ingress.packets.fetch_add(1, Ordering::Relaxed);
            if ingress.observed.lock().insert(ssrc) {
                ingress.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl RoutingBoundary for LoopbackBoundary {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn create_ingress(&self, stream_id: &str) -> Result<IngressEndpoint> {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        let addr = socket.local_addr()?;
        let id = format!("ingress-{}", Uuid::new_v4());
        let ingress = Arc::new(LoopbackIngress {
            addr,
            observed: Mutex::new(HashSet::new()),
            packets: AtomicU64::new(0),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(receive(socket, ingress.clone()));
        self.ingresses.insert(id.clone(), ingress);

        debug!(stream_id = %stream_id, ingress_id = %id, %addr, "Loopback ingress created");
        Ok(IngressEndpoint { id, rtp_addr: addr })
    }

    async fn close_ingress(&self, ingress_id: &str) -> Result<()> {
        if let Some((_, ingress)) = self.ingresses.remove(ingress_id) {
            ingress.cancel.cancel();
            debug!(ingress_id = %ingress_id, addr = %ingress.addr, "Loopback ingress closed");
        }
        Ok(())
    }

    async fn register_producer(
        &self,
        registration: &ProducerRegistration,
    ) -> Result<RegisteredProducer> {
        let ingress = self
            .ingresses
            .get(&registration.ingress_id)
            .map(|i| i.value().clone())
            .ok_or_else(|| Error::rejected("register_producer", "unknown ingress"))?;
        if self.reject_registrations.load(Ordering::Relaxed) {
            return Err(Error::rejected("register_producer", "router refused the producer"));
        }

        if !self.wait_observed(&ingress, registration.ssrc).await {
            return Err(Error::rejected(
                "register_producer",
                format!("ssrc {} never observed on ingress", registration.ssrc),
            ));
        }

        let id = format!("producer-{}", Uuid::new_v4());
        self.producers.insert(
            id.clone(),
            ProducerRecord {
                ingress_id: registration.ingress_id.clone(),
                ssrc: registration.ssrc,
                closed: false,
            },
        );
        Ok(RegisteredProducer {
            id,
            rtp_parameters: registration.rtp_parameters.clone(),
        })
    }

    async fn close_producer(&self, producer_id: &str) -> Result<()> {
        let delay = self.close_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(mut producer) = self.producers.get_mut(producer_id) {
            producer.closed = true;
        }
        self.sessions.retain(|_, s| s.producer_id != producer_id);
        Ok(())
    }

    async fn create_egress_session(&self, request: &EgressRequest) -> Result<EgressSession> {
        let producer = self
            .producers
            .get(&request.producer_id)
            .map(|p| p.value().clone())
            .filter(|p| !p.closed)
            .ok_or_else(|| Error::rejected("create_egress_session", "producer is not active"))?;

        let id = format!("session-{}", Uuid::new_v4());
        self.sessions.insert(
            id.clone(),
            SessionRecord {
                producer_id: request.producer_id.clone(),
                connected: false,
            },
        );

        let params = json!({
            "session_id": id,
            "producer_id": request.producer_id,
            "ingress_id": producer.ingress_id,
            "ssrc": producer.ssrc.value(),
            "transport": { "protocol": "udp", "host": "127.0.0.1" },
        });
        Ok(EgressSession { id, params })
    }

    async fn connect_egress_session(&self, session_id: &str, handshake: &Value) -> Result<()> {
        if !handshake.is_object() {
            return Err(Error::rejected(
                "connect_egress_session",
                "handshake parameters must be an object",
            ));
        }
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::rejected("connect_egress_session", "unknown session"))?;
        session.connected = true;
        Ok(())
    }

    async fn close_egress_session(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        Ok(())
    }
}

impl Drop for LoopbackBoundary {
    fn drop(&mut self) {
        for ingress in self.ingresses.iter() {
            ingress.cancel.cancel();
        }
    }
}
