//! Capability set of the media-routing boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;

use crate::Result;
use crate::domain::Ssrc;
use crate::ingest::ffmpeg::RTP_PAYLOAD_TYPE;

/// Clock rate of the H.264 real-time output.
pub const H264_CLOCK_RATE: u32 = 90_000;

/// Constrained baseline, level 3.1.
pub const H264_PROFILE_LEVEL_ID: &str = "42e01f";

/// An ingress endpoint that receives a stream's RTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressEndpoint {
    pub id: String,
    pub rtp_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerRegistration {
    pub stream_id: String,
    pub ingress_id: String,
    pub ssrc: Ssrc,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredProducer {
    pub id: String,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressRequest {
    pub stream_id: String,
    pub producer_id: String,
    pub consumer_id: String,
    pub client_tag: String,
    /// Opaque viewer capabilities, relayed as-is.
    pub capabilities: Value,
}

/// Session parameters the viewer needs to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressSession {
    pub id: String,
    pub params: Value,
}

/// Operations the relay needs from a media router.
#[async_trait]
pub trait RoutingBoundary: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_ingress(&self, stream_id: &str) -> Result<IngressEndpoint>;

    async fn close_ingress(&self, ingress_id: &str) -> Result<()>;

    async fn register_producer(&self, registration: &ProducerRegistration)
    -> Result<RegisteredProducer>;

    async fn close_producer(&self, producer_id: &str) -> Result<()>;

    async fn create_egress_session(&self, request: &EgressRequest) -> Result<EgressSession>;

    async fn connect_egress_session(&self, session_id: &str, handshake: &Value) -> Result<()>;

    async fn close_egress_session(&self, session_id: &str) -> Result<()>;
}

/// RTP parameters for the H.264 real-time output carrying `ssrc`.
pub fn h264_rtp_parameters(ssrc: Ssrc) -> Value {
    json!({
        "codecs": [{
            "mimeType": "video/H264",
            "payloadType": RTP_PAYLOAD_TYPE,
            "clockRate": H264_CLOCK_RATE,
            "parameters": {
                "packetization-mode": 1,
                "profile-level-id": H264_PROFILE_LEVEL_ID,
                "level-asymmetry-allowed": 1,
            },
        }],
        "encodings": [{ "ssrc": ssrc.value() }],
    })
}

/// Negotiation parameters recorded on a stream when ingestion starts.
pub fn codec_params(ingress: &IngressEndpoint) -> Value {
    json!({
        "codec": "h264",
        "profile": "baseline",
        "payload_type": RTP_PAYLOAD_TYPE,
        "clock_rate": H264_CLOCK_RATE,
        "rtp_port": ingress.rtp_addr.port(),
    })
}
