//! FFmpeg ingest engine.
//!
//! One ffmpeg process pulls the source and writes two outputs: a low-latency
//! RTP stream for the routing boundary and an HLS archive on disk.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{IngestEngine, IngestLaunch, IngestProcess};
use super::process_runner::spawn_process_waiter;
use crate::config::IngestConfig;
use crate::{Error, Result};

/// RTP payload type used for the real-time output.
pub const RTP_PAYLOAD_TYPE: u8 = 96;

/// Maximum RTP packet size requested from ffmpeg.
const RTP_PACKET_SIZE: usize = 1200;

/// Encoder settings for both outputs.
#[derive(Debug, Clone)]
pub struct TranscodeProfile {
    pub realtime_bitrate_kbps: u32,
    pub archive_bitrate_kbps: u32,
    pub hls_segment_secs: u32,
}

impl From<&IngestConfig> for TranscodeProfile {
    fn from(config: &IngestConfig) -> Self {
        Self {
            realtime_bitrate_kbps: config.realtime_bitrate_kbps,
            archive_bitrate_kbps: config.archive_bitrate_kbps,
            hls_segment_secs: config.hls_segment_secs,
        }
    }
}

pub struct FfmpegEngine {
    binary_path: String,
    profile: TranscodeProfile,
    stop_grace: Duration,
    version: Option<String>,
}

impl FfmpegEngine {
    /// Check the configured binary off the runtime threads and build the
    /// engine. A missing binary leaves the engine unavailable.
    pub async fn detect(config: &IngestConfig) -> Self {
        let path = config.ffmpeg_path.clone();
        let version = tokio::task::spawn_blocking(move || process_utils::binary_version(&path))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "ffmpeg version check failed");
                None
            });
        Self::with_version(config, version)
    }

    fn with_version(config: &IngestConfig, version: Option<String>) -> Self {
        Self {
            binary_path: config.ffmpeg_path.clone(),
            profile: TranscodeProfile::from(config),
            stop_grace: config.stop_grace(),
            version,
        }
    }

    /// Build ffmpeg command arguments.
    fn build_args(&self, launch: &IngestLaunch) -> Vec<String> {
        let profile = &self.profile;
        let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "warning", "-y"]
            .into_iter()
            .map(String::from)
            .collect();

        // Input
        if matches!(launch.source.scheme(), "rtsp" | "rtsps") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend(["-i".into(), launch.source.as_str().to_string()]);

        // Real-time output: zero-latency RTP, small buffers, no B-frames
        let rt_bitrate = format!("{}k", profile.realtime_bitrate_kbps);
        let rt_bufsize = format!("{}k", profile.realtime_bitrate_kbps / 2);
        args.extend(
            [
                "-map", "0:v:0", "-an",
                "-c:v", "libx264",
                "-preset", "ultrafast",
                "-tune", "zerolatency",
                "-profile:v", "baseline",
                "-bf", "0",
                "-g", "30",
            ]
            .map(String::from),
        );
        args.extend([
            "-b:v".into(),
            rt_bitrate.clone(),
            "-maxrate".into(),
            rt_bitrate,
            "-bufsize".into(),
            rt_bufsize,
            "-payload_type".into(),
            RTP_PAYLOAD_TYPE.to_string(),
            "-f".into(),
            "rtp".into(),
            format!("rtp://{}?pkt_size={}", launch.rtp_target, RTP_PACKET_SIZE),
        ]);

        // Archival output: quality preset, larger buffer, HLS segments
        let ar_bitrate = format!("{}k", profile.archive_bitrate_kbps);
        let ar_bufsize = format!("{}k", profile.archive_bitrate_kbps * 2);
        args.extend(
            [
                "-map", "0:v:0", "-map", "0:a?",
                "-c:v", "libx264",
                "-preset", "medium",
                "-c:a", "aac",
            ]
            .map(String::from),
        );
        args.extend([
            "-b:v".into(),
            ar_bitrate,
            "-bufsize".into(),
            ar_bufsize,
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            profile.hls_segment_secs.to_string(),
            "-hls_list_size".into(),
            "0".into(),
            "-hls_flags".into(),
            "append_list".into(),
            "-hls_segment_filename".into(),
            launch
                .archive_dir
                .join("segment_%06d.ts")
                .to_string_lossy()
                .to_string(),
            launch
                .archive_dir
                .join("index.m3u8")
                .to_string_lossy()
                .to_string(),
        ]);

        args
    }
}

#[async_trait]
impl IngestEngine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn launch(&self, launch: IngestLaunch) -> Result<IngestProcess> {
        tokio::fs::create_dir_all(&launch.archive_dir).await?;
        let args = self.build_args(&launch);

        info!(
            stream_id = %launch.stream_id,
            generation = launch.generation,
            source = %launch.source.redacted(),
            rtp_target = %launch.rtp_target,
            "Starting ffmpeg"
        );
        debug!(stream_id = %launch.stream_id, ?args, "ffmpeg arguments");

        let mut child = process_utils::supervised_command(&self.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to spawn ffmpeg: {}", e)))?;

        let pid = child.id();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other("Failed to capture ffmpeg stderr".to_string()))?;

        let cancel = CancellationToken::new();

        // Drain stderr so the pipe never fills
        let stream_id = launch.stream_id.clone();
        let generation = launch.generation;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.contains("Error") || line.contains("error") {
                            warn!(stream_id = %stream_id, generation, "ffmpeg: {}", line);
                        } else {
                            debug!(stream_id = %stream_id, generation, "ffmpeg: {}", line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(stream_id = %stream_id, "Error reading ffmpeg output: {}", e);
                        break;
                    }
                }
            }
        });

        let exit = spawn_process_waiter(child, cancel.clone(), self.stop_grace);
        Ok(IngestProcess::new(pid, exit, cancel))
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}
