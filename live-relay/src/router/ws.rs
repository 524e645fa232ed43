//! Routing boundary backed by an external media router reached over a
//! WebSocket request/response channel.
//!
//! Requests are `{"id", "method", "data"}` frames. Responses echo the id and
//! carry either `{"ok": true, "data": ...}` or `{"ok": false, "error": ...}`.
//! The connection is established lazily and re-established on the next
//! request after it drops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, info, trace, warn};

use super::boundary::{
    EgressRequest, EgressSession, IngressEndpoint, ProducerRegistration, RegisteredProducer,
    RoutingBoundary,
};
use crate::{Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

struct Pending {
    epoch: u64,
    method: &'static str,
    reply: oneshot::Sender<Result<Value>>,
}

struct Connection {
    epoch: u64,
    sink: WsSink,
    alive: Arc<AtomicBool>,
}

/// Removes a pending request if the caller gives up before the reply.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, Pending>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct WsBoundary {
    url: String,
    next_id: AtomicU64,
    next_epoch: AtomicU64,
    pending: Arc<DashMap<u64, Pending>>,
    connection: Mutex<Option<Connection>>,
}

impl WsBoundary {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            next_id: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            connection: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Connection> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Boundary(format!("connect to {} failed: {e}", self.url)))?;
        info!(url = %self.url, "Connected to media router");

        let (sink, mut stream) = ws_stream.split();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        let pending = self.pending.clone();
        let reader_alive = alive.clone();

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => dispatch(&pending, text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Media router connection error");
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            // Dropping the senders fails every request still waiting on this connection.
            pending.retain(|_, p| p.epoch != epoch);
            debug!(epoch, "Media router connection closed");
        });

        Ok(Connection { epoch, sink, alive })
    }

    async fn request(&self, method: &'static str, data: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        {
            let mut slot = self.connection.lock().await;
            if slot
                .as_ref()
                .is_none_or(|c| !c.alive.load(Ordering::SeqCst))
            {
                *slot = Some(self.connect().await?);
            }
            let Some(connection) = slot.as_mut() else {
                return Err(Error::Boundary("no router connection".into()));
            };

            self.pending.insert(
                id,
                Pending {
                    epoch: connection.epoch,
                    method,
                    reply: tx,
                },
            );
            let frame = json!({ "id": id, "method": method, "data": data }).to_string();
            trace!(id, method, "Sending router request");
            if let Err(e) = connection.sink.send(Message::Text(frame.into())).await {
                *slot = None;
                return Err(Error::Boundary(format!("{method} send failed: {e}")));
            }
        }

        rx.await
            .map_err(|_| Error::Boundary(format!("connection closed during {method}")))?
    }
}

fn dispatch(pending: &DashMap<u64, Pending>, text: &str) {
    let response: Response = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Discarding malformed router frame");
            return;
        }
    };
    let Some((_, waiter)) = pending.remove(&response.id) else {
        trace!(id = response.id, "Reply for an abandoned request");
        return;
    };
    let outcome = if response.ok {
        Ok(response.data)
    } else {
        Err(Error::rejected(
            waiter.method,
            response.error.unwrap_or_else(|| "rejected".into()),
        ))
    };
    let _ = waiter.reply.send(outcome);
}

fn field<T: serde::de::DeserializeOwned>(data: &Value, key: &str, method: &str) -> Result<T> {
    data.get(key)
        .cloned()
        .ok_or_else(|| Error::Boundary(format!("{method} reply is missing '{key}'")))
        .and_then(|v| serde_json::from_value(v).map_err(Error::from))
}

#[async_trait]
impl RoutingBoundary for WsBoundary {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn create_ingress(&self, stream_id: &str) -> Result<IngressEndpoint> {
        let data = self
            .request("create_ingress", json!({ "stream_id": stream_id }))
            .await?;
        let id: String = field(&data, "id", "create_ingress")?;
        let rtp_addr: SocketAddr = field(&data, "rtp_addr", "create_ingress")?;
        Ok(IngressEndpoint { id, rtp_addr })
    }

    async fn close_ingress(&self, ingress_id: &str) -> Result<()> {
        self.request("close_ingress", json!({ "ingress_id": ingress_id }))
            .await
            .map(drop)
    }

    async fn register_producer(
        &self,
        registration: &ProducerRegistration,
    ) -> Result<RegisteredProducer> {
        let data = self
            .request("register_producer", serde_json::to_value(registration)?)
            .await?;
        let id: String = field(&data, "id", "register_producer")?;
        let rtp_parameters = data
            .get("rtp_parameters")
            .cloned()
            .unwrap_or_else(|| registration.rtp_parameters.clone());
        Ok(RegisteredProducer { id, rtp_parameters })
    }

    async fn close_producer(&self, producer_id: &str) -> Result<()> {
        self.request("close_producer", json!({ "producer_id": producer_id }))
            .await
            .map(drop)
    }

    async fn create_egress_session(&self, request: &EgressRequest) -> Result<EgressSession> {
        let data = self
            .request("create_egress_session", serde_json::to_value(request)?)
            .await?;
        let id: String = field(&data, "id", "create_egress_session")?;
        let params = data.get("params").cloned().unwrap_or(Value::Null);
        Ok(EgressSession { id, params })
    }

    async fn connect_egress_session(&self, session_id: &str, handshake: &Value) -> Result<()> {
        self.request(
            "connect_egress_session",
            json!({ "session_id": session_id, "handshake": handshake }),
        )
        .await
        .map(drop)
    }

    async fn close_egress_session(&self, session_id: &str) -> Result<()> {
        self.request("close_egress_session", json!({ "session_id": session_id }))
            .await
            .map(drop)
    }
}
