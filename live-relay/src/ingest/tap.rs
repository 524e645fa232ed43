//! Loopback UDP tap between the transcoder's real-time output and the
//! routing boundary's ingress.
//!
//! The tap counts traffic, captures the SSRC of the first valid RTP packet of
//! each process generation, and forwards every datagram unchanged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::rtp::RtpHeader;
use crate::Result;
use crate::domain::Ssrc;

/// Largest datagram the tap accepts.
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug)]
struct Discovery {
    generation: u64,
    ssrc: Option<Ssrc>,
    /// SSRC of the previous generation; its stragglers are not rediscovered.
    retired: Option<Ssrc>,
    generation_started: Instant,
    last_packet: Option<Instant>,
}

#[derive(Debug)]
struct TapShared {
    stream_id: String,
    bytes: AtomicU64,
    packets: AtomicU64,
    forward_errors: AtomicU64,
    discovery: Mutex<Discovery>,
    ssrc_tx: watch::Sender<Option<(u64, Ssrc)>>,
}

/// Counters at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct TapSnapshot {
    pub bytes: u64,
    pub packets: u64,
    pub forward_errors: u64,
    /// Time since the last valid packet, or since the generation began.
    pub idle: Duration,
}

pub struct IngestTap {
    local_addr: SocketAddr,
    shared: Arc<TapShared>,
    cancel: CancellationToken,
}

impl IngestTap {
    /// Bind a tap on loopback that forwards to `forward_to`.
    ///
    /// The receive task stops when `cancel` fires or [`close`](Self::close)
    /// is called.
    pub async fn bind(
        stream_id: &str,
        forward_to: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        let local_addr = socket.local_addr()?;
        let (ssrc_tx, _) = watch::channel(None);

        let shared = Arc::new(TapShared {
            stream_id: stream_id.to_string(),
            bytes: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            forward_errors: AtomicU64::new(0),
            discovery: Mutex::new(Discovery {
                generation: 0,
                ssrc: None,
                retired: None,
                generation_started: Instant::now(),
                last_packet: None,
            }),
            ssrc_tx,
        });

        debug!(stream_id = %stream_id, %local_addr, %forward_to, "Ingest tap bound");
        tokio::spawn(run_tap(socket, forward_to, shared.clone(), cancel.clone()));

        Ok(Self {
            local_addr,
            shared,
            cancel,
        })
    }

    /// Address the transcoder's RTP output should target.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start a new process generation: the next valid packet's SSRC is
    /// reported for `generation`.
    pub fn begin_generation(&self, generation: u64) {
        let mut discovery = self.shared.discovery.lock();
        discovery.retired = discovery.ssrc.take().or(discovery.retired);
        discovery.generation = generation;
        discovery.generation_started = Instant::now();
        discovery.last_packet = None;
    }

    /// Wait up to `window` for the SSRC of `generation`.
    pub async fn wait_for_ssrc(&self, generation: u64, window: Duration) -> Option<Ssrc> {
        let mut rx = self.shared.ssrc_tx.subscribe();
        let found = tokio::time::timeout(
            window,
            rx.wait_for(|v| matches!(v, Some((g, _)) if *g == generation)),
        )
        .await;

        match found {
            Ok(Ok(value)) => (*value).map(|(_, ssrc)| ssrc),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> TapSnapshot {
        let idle = {
            let discovery = self.shared.discovery.lock();
            discovery
                .last_packet
                .unwrap_or(discovery.generation_started)
                .elapsed()
        };
        TapSnapshot {
            bytes: self.shared.bytes.load(Ordering::Relaxed),
            packets: self.shared.packets.load(Ordering::Relaxed),
            forward_errors: self.shared.forward_errors.load(Ordering::Relaxed),
            idle,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for IngestTap {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_tap(
    socket: UdpSocket,
    forward_to: SocketAddr,
    shared: Arc<TapShared>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => len,
                Err(e) => {
                    // ICMP port-unreachable from a previous send surfaces here on some
                    // platforms; the socket itself is still usable.
                    trace!(stream_id = %shared.stream_id, error = %e, "Tap receive error");
                    continue;
                }
            },
        };
        let datagram = &buf[..len];

        if let Ok(header) = RtpHeader::parse(datagram) {
            shared.bytes.fetch_add(len as u64, Ordering::Relaxed);
            shared.packets.fetch_add(1, Ordering::Relaxed);
            observe(&shared, header.ssrc);
        }

        if let Err(e) = socket.send_to(datagram, forward_to).await {
            let errors = shared.forward_errors.fetch_add(1, Ordering::Relaxed) + 1;
            if errors == 1 || errors % 1_000 == 0 {
                warn!(
                    stream_id = %shared.stream_id,
                    %forward_to,
                    errors,
                    error = %e,
                    "Failed to forward RTP to ingress"
                );
            }
        }
    }

    debug!(stream_id = %shared.stream_id, "Ingest tap stopped");
}

fn observe(shared: &TapShared, ssrc: Ssrc) {
    let mut discovery = shared.discovery.lock();
    discovery.last_packet = Some(Instant::now());

    if discovery.ssrc.is_none() && discovery.retired != Some(ssrc) {
        discovery.ssrc = Some(ssrc);
        let generation = discovery.generation;
        drop(discovery);
        debug!(stream_id = %shared.stream_id, generation, %ssrc, "Source identifier captured");
        shared.ssrc_tx.send_replace(Some((generation, ssrc)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::rtp::RtpHeader;

    fn packet(ssrc: u32, seq: u16) -> bytes::Bytes {
        RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 96,
            sequence: seq,
            timestamp: seq as u32 * 3000,
            ssrc: Ssrc(ssrc),
        }
        .packet(&[0u8; 100])
    }

    #[tokio::test]
    async fn test_tap_captures_ssrc_and_forwards() {
        let sink = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let tap = IngestTap::bind("s1", sink.local_addr().unwrap(), CancellationToken::new())
            .await
            .unwrap();
        tap.begin_generation(1);

        let source = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        source.send_to(&packet(0xAABB_CCDD, 1), tap.local_addr()).await.unwrap();

        let ssrc = tap.wait_for_ssrc(1, Duration::from_secs(2)).await;
        assert_eq!(ssrc, Some(Ssrc(0xAABB_CCDD)));

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), sink.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 112);

        let snapshot = tap.snapshot();
        assert_eq!(snapshot.packets, 1);
        assert_eq!(snapshot.bytes, 112);
    }

    #[tokio::test]
    async fn test_new_generation_ignores_retired_ssrc() {
        let sink = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let tap = IngestTap::bind("s1", sink.local_addr().unwrap(), CancellationToken::new())
            .await
            .unwrap();
        let source = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

        tap.begin_generation(1);
        source.send_to(&packet(1, 1), tap.local_addr()).await.unwrap();
        assert_eq!(tap.wait_for_ssrc(1, Duration::from_secs(2)).await, Some(Ssrc(1)));

        tap.begin_generation(2);
        source.send_to(&packet(1, 2), tap.local_addr()).await.unwrap();
        source.send_to(&packet(2, 1), tap.local_addr()).await.unwrap();
        assert_eq!(tap.wait_for_ssrc(2, Duration::from_secs(2)).await, Some(Ssrc(2)));
    }

    #[tokio::test]
    async fn test_wait_for_ssrc_times_out_without_traffic() {
        let tap = IngestTap::bind(
            "s1",
            "127.0.0.1:9".parse().unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        tap.begin_generation(1);
        assert_eq!(tap.wait_for_ssrc(1, Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_non_rtp_is_forwarded_but_not_counted() {
        let sink = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let tap = IngestTap::bind("s1", sink.local_addr().unwrap(), CancellationToken::new())
            .await
            .unwrap();
        let source = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        source.send_to(b"hello", tap.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), sink.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(tap.snapshot().packets, 0);
    }
}
