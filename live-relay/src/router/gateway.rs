//! Gateway over the routing boundary.
//!
//! Bounds every boundary call with the request timeout and keeps the
//! consumer registry consistent with the sessions that exist on the
//! boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::boundary::{
    EgressRequest, IngressEndpoint, ProducerRegistration, RoutingBoundary, h264_rtp_parameters,
};
use crate::consumer::{ConsumerSessionRegistry, SessionCloser};
use crate::domain::consumer::close_reason;
use crate::domain::{Consumer, ConsumerState, Producer, ProducerState, Ssrc};
use crate::{Error, Result};

/// A new consumer and the parameters its viewer needs to connect.
#[derive(Debug, Clone, Serialize)]
pub struct AttachedConsumer {
    pub consumer: Consumer,
    pub session: Value,
}

pub struct RouterGateway {
    boundary: Arc<dyn RoutingBoundary>,
    registry: Arc<ConsumerSessionRegistry>,
    request_timeout: Duration,
}

impl RouterGateway {
    pub fn new(
        boundary: Arc<dyn RoutingBoundary>,
        registry: Arc<ConsumerSessionRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            boundary,
            registry,
            request_timeout,
        }
    }

    pub fn boundary_name(&self) -> &'static str {
        self.boundary.name()
    }

    async fn call<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| Error::timeout(operation, self.request_timeout))?
    }

    pub async fn create_ingress(&self, stream_id: &str) -> Result<IngressEndpoint> {
        let ingress = self
            .call("create_ingress", self.boundary.create_ingress(stream_id))
            .await?;
        debug!(stream_id = %stream_id, ingress_id = %ingress.id, rtp_addr = %ingress.rtp_addr, "Ingress created");
        Ok(ingress)
    }

    pub async fn close_ingress(&self, ingress_id: &str) -> Result<()> {
        self.call("close_ingress", self.boundary.close_ingress(ingress_id))
            .await
    }

    /// Register the stream's media with the boundary and bind the stream's
    /// consumer bucket to the new producer.
    pub async fn register_producer(
        &self,
        stream_id: &str,
        ingress_id: &str,
        ssrc: Ssrc,
    ) -> Result<Producer> {
        let registration = ProducerRegistration {
            stream_id: stream_id.to_string(),
            ingress_id: ingress_id.to_string(),
            ssrc,
            rtp_parameters: h264_rtp_parameters(ssrc),
        };

        let registered = self
            .call(
                "register_producer",
                self.boundary.register_producer(&registration),
            )
            .await?;

        let producer = Producer {
            id: registered.id,
            stream_id: stream_id.to_string(),
            ingress_id: ingress_id.to_string(),
            ssrc,
            state: ProducerState::Active,
            rtp_parameters: registered.rtp_parameters,
            created_at: Utc::now(),
            closed_at: None,
        };
        self.registry.open_stream(stream_id, &producer.id);

        info!(stream_id = %stream_id, producer_id = %producer.id, %ssrc, "Producer registered");
        Ok(producer)
    }

    /// Close a producer and the consumers attached to it.
    pub async fn close_producer(&self, producer: &mut Producer, reason: &str) -> Vec<Consumer> {
        let closed = self
            .registry
            .close_producer_consumers(&producer.stream_id, &producer.id, reason);
        self.release_sessions(&closed).await;

        if producer.state != ProducerState::Closed {
            if let Err(e) = self
                .call("close_producer", self.boundary.close_producer(&producer.id))
                .await
            {
                warn!(producer_id = %producer.id, error = %e, "Failed to close producer on boundary");
            }
            producer.mark_closed();
            info!(
                stream_id = %producer.stream_id,
                producer_id = %producer.id,
                consumers = closed.len(),
                "Producer closed"
            );
        }
        closed
    }

    /// Create an egress session for a viewer of `producer_id`.
    pub async fn attach_consumer(
        &self,
        stream_id: &str,
        producer_id: &str,
        client_tag: &str,
        capabilities: Value,
    ) -> Result<AttachedConsumer> {
        let consumer_id = Uuid::new_v4().to_string();
        let request = EgressRequest {
            stream_id: stream_id.to_string(),
            producer_id: producer_id.to_string(),
            consumer_id: consumer_id.clone(),
            client_tag: client_tag.to_string(),
            capabilities,
        };
        let session = self
            .call(
                "create_egress_session",
                self.boundary.create_egress_session(&request),
            )
            .await?;

        let now = Utc::now();
        let consumer = Consumer {
            id: consumer_id,
            stream_id: stream_id.to_string(),
            producer_id: producer_id.to_string(),
            session_id: session.id.clone(),
            client_tag: client_tag.to_string(),
            state: ConsumerState::Connecting,
            created_at: now,
            last_seen_at: now,
            closed_at: None,
            close_reason: None,
        };

        // The producer may have been replaced or the stream stopped while the
        // session was being created.
        if let Err(e) = self.registry.insert(consumer.clone()) {
            self.release_session(&session.id).await;
            return Err(e);
        }

        info!(
            stream_id = %stream_id,
            consumer_id = %consumer.id,
            client_tag = %client_tag,
            "Consumer attached"
        );
        Ok(AttachedConsumer {
            consumer,
            session: session.params,
        })
    }

    /// `connecting -> connected`. A failed handshake closes only this
    /// consumer.
    pub async fn complete_handshake(&self, consumer_id: &str, handshake: &Value) -> Result<Consumer> {
        let consumer = self
            .registry
            .get(consumer_id)
            .ok_or_else(|| Error::not_found("Consumer", consumer_id))?;
        if consumer.state == ConsumerState::Connected {
            return Ok(consumer);
        }

        let connected = self
            .call(
                "connect_egress_session",
                self.boundary
                    .connect_egress_session(&consumer.session_id, handshake),
            )
            .await;

        match connected {
            Ok(()) => {
                let consumer = self.registry.mark_connected(consumer_id)?;
                debug!(consumer_id = %consumer_id, "Consumer connected");
                Ok(consumer)
            }
            Err(e) => {
                warn!(consumer_id = %consumer_id, error = %e, "Viewer handshake failed");
                if let Some(closed) = self.registry.remove(consumer_id, close_reason::HANDSHAKE_FAILED) {
                    self.release_session(&closed.session_id).await;
                }
                Err(Error::Handshake(e.to_string()))
            }
        }
    }

    /// Remove a consumer and its session. Idempotent.
    pub async fn detach_consumer(&self, consumer_id: &str, reason: &str) -> Option<Consumer> {
        let consumer = self.registry.remove(consumer_id, reason)?;
        self.release_session(&consumer.session_id).await;
        info!(consumer_id = %consumer_id, stream_id = %consumer.stream_id, reason, "Consumer detached");
        Some(consumer)
    }

    /// Forced eviction. Unlike [`detach_consumer`](Self::detach_consumer),
    /// an unknown consumer is an error.
    pub async fn evict_consumer(&self, consumer_id: &str, reason: &str) -> Result<Consumer> {
        let consumer = self.registry.force_close(consumer_id, reason)?;
        self.release_session(&consumer.session_id).await;
        Ok(consumer)
    }

    /// Close every consumer of a stream.
    pub async fn close_stream_consumers(&self, stream_id: &str, reason: &str) -> Vec<Consumer> {
        let closed = self.registry.close_stream(stream_id, reason);
        self.release_sessions(&closed).await;
        closed
    }

    async fn release_sessions(&self, consumers: &[Consumer]) {
        let releases = consumers.iter().map(|c| self.release_session(&c.session_id));
        futures::future::join_all(releases).await;
    }

    async fn release_session(&self, session_id: &str) {
        if let Err(e) = self
            .call(
                "close_egress_session",
                self.boundary.close_egress_session(session_id),
            )
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to close egress session");
        }
    }
}

#[async_trait]
impl SessionCloser for RouterGateway {
    async fn close_session(&self, consumer: &Consumer) -> Result<()> {
        self.call(
            "close_egress_session",
            self.boundary.close_egress_session(&consumer.session_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::router::loopback::LoopbackBoundary;
    use serde_json::json;
    use tokio::net::UdpSocket;

    use crate::ingest::rtp::RtpHeader;

    async fn setup() -> (RouterGateway, Arc<LoopbackBoundary>, Arc<ConsumerSessionRegistry>) {
        let boundary = Arc::new(LoopbackBoundary::new(Duration::from_millis(500)));
        let registry = Arc::new(ConsumerSessionRegistry::new(ConsumerConfig::default()));
        let gateway = RouterGateway::new(boundary.clone(), registry.clone(), Duration::from_secs(2));
        (gateway, boundary, registry)
    }

    async fn send_rtp(to: std::net::SocketAddr, ssrc: u32) {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let packet = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 96,
            sequence: 1,
            timestamp: 0,
            ssrc: Ssrc(ssrc),
        }
        .packet(&[0u8; 32]);
        socket.send_to(&packet, to).await.unwrap();
    }

    async fn live_producer(gateway: &RouterGateway) -> Producer {
        let ingress = gateway.create_ingress("s1").await.unwrap();
        send_rtp(ingress.rtp_addr, 77).await;
        gateway
            .register_producer("s1", &ingress.id, Ssrc(77))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_attach_handshake_detach() {
        let (gateway, boundary, registry) = setup().await;
        let producer = live_producer(&gateway).await;

        let attached = gateway
            .attach_consumer("s1", &producer.id, "viewer-a", json!({}))
            .await
            .unwrap();
        assert_eq!(attached.consumer.state, ConsumerState::Connecting);
        assert_eq!(boundary.session_count(), 1);

        let consumer = gateway
            .complete_handshake(&attached.consumer.id, &json!({"dtls": "fingerprint"}))
            .await
            .unwrap();
        assert_eq!(consumer.state, ConsumerState::Connected);

        let detached = gateway
            .detach_consumer(&consumer.id, close_reason::DETACHED)
            .await
            .unwrap();
        assert_eq!(detached.state, ConsumerState::Closed);
        assert!(gateway.detach_consumer(&consumer.id, close_reason::DETACHED).await.is_none());
        assert_eq!(boundary.session_count(), 0);
        assert_eq!(registry.count("s1"), 0);
        assert!(boundary.is_producer_active(&producer.id));
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_only_that_consumer() {
        let (gateway, boundary, registry) = setup().await;
        let producer = live_producer(&gateway).await;

        let a = gateway
            .attach_consumer("s1", &producer.id, "a", json!({}))
            .await
            .unwrap();
        let b = gateway
            .attach_consumer("s1", &producer.id, "b", json!({}))
            .await
            .unwrap();

        let err = gateway
            .complete_handshake(&a.consumer.id, &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert!(registry.get(&a.consumer.id).is_none());
        assert!(registry.get(&b.consumer.id).is_some());
        assert_eq!(boundary.session_count(), 1);
        assert!(boundary.is_producer_active(&producer.id));
    }

    #[tokio::test]
    async fn test_close_producer_closes_its_consumers() {
        let (gateway, boundary, registry) = setup().await;
        let mut producer = live_producer(&gateway).await;
        gateway
            .attach_consumer("s1", &producer.id, "a", json!({}))
            .await
            .unwrap();

        let closed = gateway
            .close_producer(&mut producer, close_reason::PRODUCER_REPLACED)
            .await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason.as_deref(), Some("producer_replaced"));
        assert_eq!(producer.state, ProducerState::Closed);
        assert!(!boundary.is_producer_active(&producer.id));
        assert_eq!(registry.count("s1"), 0);

        let late = gateway
            .attach_consumer("s1", &producer.id, "late", json!({}))
            .await;
        assert!(late.is_err());
        assert_eq!(boundary.session_count(), 0);
    }

    #[tokio::test]
    async fn test_evict_releases_boundary_session() {
        let (gateway, boundary, registry) = setup().await;
        let producer = live_producer(&gateway).await;
        let attached = gateway
            .attach_consumer("s1", &producer.id, "viewer", json!({}))
            .await
            .unwrap();
        assert_eq!(boundary.session_count(), 1);

        let evicted = gateway
            .evict_consumer(&attached.consumer.id, close_reason::EVICTED)
            .await
            .unwrap();
        assert_eq!(evicted.state, ConsumerState::Closed);
        assert_eq!(evicted.close_reason.as_deref(), Some("evicted"));
        assert_eq!(registry.count("s1"), 0);
        assert_eq!(boundary.session_count(), 0);
        assert!(boundary.is_producer_active(&producer.id));

        let err = gateway
            .evict_consumer(&attached.consumer.id, close_reason::EVICTED)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_register_rejects_unobserved_ssrc() {
        let (gateway, _boundary, _registry) = setup().await;
        let ingress = gateway.create_ingress("s1").await.unwrap();
        let err = gateway
            .register_producer("s1", &ingress.id, Ssrc(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BoundaryRejected { .. }));
    }
}
