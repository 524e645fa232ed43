//! Relay configuration.
//!
//! Configuration is layered: built-in defaults, then an optional JSON file
//! named by `LIVE_RELAY_CONFIG`, then individual environment overrides.
//! Durations are stored as integer milliseconds and exposed through
//! [`Duration`] accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_FILE_ENV: &str = "LIVE_RELAY_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ingest: IngestConfig,
    pub router: RouterConfig,
    pub consumers: ConsumerConfig,
    pub health: HealthConfig,
    pub controller: ControllerConfig,
    pub persistence: PersistenceConfig,
    pub api: ApiConfig,
    pub logging: LoggingSettings,
}

/// Ingestion process and supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub ffmpeg_path: String,
    /// Root directory for archival output; each stream gets a subdirectory.
    pub archive_root: PathBuf,
    pub discovery_window_ms: u64,
    pub max_restarts: usize,
    pub retry_window_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub stall_timeout_ms: u64,
    /// Interval between throughput reports.
    pub report_interval_ms: u64,
    /// Time a process gets to exit after a graceful quit request.
    pub stop_grace_ms: u64,
    pub event_capacity: usize,
    pub realtime_bitrate_kbps: u32,
    pub archive_bitrate_kbps: u32,
    pub hls_segment_secs: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            archive_root: PathBuf::from("archive"),
            discovery_window_ms: 1_000,
            max_restarts: 3,
            retry_window_ms: 60_000,
            backoff_base_ms: 500,
            backoff_max_ms: 5_000,
            stall_timeout_ms: 10_000,
            report_interval_ms: 1_000,
            stop_grace_ms: 2_000,
            event_capacity: 64,
            realtime_bitrate_kbps: 1_500,
            archive_bitrate_kbps: 4_000,
            hls_segment_secs: 10,
        }
    }
}

impl IngestConfig {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Routing boundary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// WebSocket URL of the routing boundary. `None` selects the in-process
    /// loopback boundary.
    pub url: Option<String>,
    pub request_timeout_ms: u64,
    /// How long the loopback boundary waits to observe an SSRC on the wire.
    pub observe_grace_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: 5_000,
            observe_grace_ms: 500,
        }
    }
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn observe_grace(&self) -> Duration {
        Duration::from_millis(self.observe_grace_ms)
    }
}

/// Consumer liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            sweep_interval_ms: 15_000,
            handshake_timeout_ms: 30_000,
        }
    }
}

impl ConsumerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub broadcast_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            broadcast_capacity: 64,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Per-stream actor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mailbox_capacity: usize,
    /// Upper bound for a caller waiting on a stream operation reply.
    pub reply_timeout_ms: u64,
    /// How long a closed stream stays in memory before reads are served
    /// from the repository.
    pub closed_retention_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 32,
            reply_timeout_ms: 30_000,
            closed_retention_ms: 300_000,
        }
    }
}

impl ControllerConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn closed_retention(&self) -> Duration {
        Duration::from_millis(self.closed_retention_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// sqlx connection string, or `memory` for the in-process repository.
    pub database_url: String,
    pub max_connections: u32,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:live-relay.db?mode=rwc".to_string(),
            max_connections: 5,
            retry_max_attempts: 5,
            retry_base_ms: 100,
            retry_max_ms: 5_000,
        }
    }
}

impl PersistenceConfig {
    pub fn is_memory(&self) -> bool {
        self.database_url.eq_ignore_ascii_case("memory")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
    /// Directory for daily-rolled log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Load configuration from `.env`, the optional config file and the
    /// environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Apply the supported environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("DATABASE_URL") {
            self.persistence.database_url = url;
        }
        if let Some(bind_address) = var("API_BIND_ADDRESS") {
            self.api.bind_address = bind_address;
        }
        if let Some(port) = var("API_PORT")
            && let Ok(parsed) = port.trim().parse::<u16>()
        {
            self.api.port = parsed;
        }
        if let Some(path) = var("FFMPEG_PATH") {
            self.ingest.ffmpeg_path = path;
        }
        if let Some(url) = var("ROUTER_URL") {
            self.router.url = Some(url);
        }
        if let Some(root) = var("ARCHIVE_ROOT") {
            self.ingest.archive_root = PathBuf::from(root);
        }
        if let Some(dir) = var("LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("ingest.discovery_window_ms", self.ingest.discovery_window_ms),
            ("ingest.retry_window_ms", self.ingest.retry_window_ms),
            ("ingest.stall_timeout_ms", self.ingest.stall_timeout_ms),
            ("ingest.report_interval_ms", self.ingest.report_interval_ms),
            ("router.request_timeout_ms", self.router.request_timeout_ms),
            ("consumers.heartbeat_timeout_ms", self.consumers.heartbeat_timeout_ms),
            ("consumers.sweep_interval_ms", self.consumers.sweep_interval_ms),
            ("consumers.handshake_timeout_ms", self.consumers.handshake_timeout_ms),
            ("health.interval_ms", self.health.interval_ms),
            ("controller.reply_timeout_ms", self.controller.reply_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }

        if self.ingest.event_capacity == 0 || self.controller.mailbox_capacity == 0 {
            return Err(Error::config("channel capacities must be greater than zero"));
        }
        if self.health.broadcast_capacity == 0 {
            return Err(Error::config("health.broadcast_capacity must be greater than zero"));
        }
        if self.ingest.backoff_base_ms > self.ingest.backoff_max_ms {
            return Err(Error::config(
                "ingest.backoff_base_ms must not exceed ingest.backoff_max_ms",
            ));
        }
        if self.ingest.ffmpeg_path.trim().is_empty() {
            return Err(Error::config("ingest.ffmpeg_path must not be empty"));
        }
        if let Some(url) = &self.router.url {
            let parsed = url::Url::parse(url)
                .map_err(|e| Error::config(format!("invalid router url '{url}': {e}")))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(Error::config(format!(
                    "router url must use ws:// or wss://, got '{}'",
                    parsed.scheme()
                )));
            }
        }
        if self.persistence.max_connections == 0 {
            return Err(Error::config("persistence.max_connections must be greater than zero"));
        }

        Ok(())
    }
}

/// Per-stream overrides supplied with a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPolicy {
    pub discovery_window_ms: Option<u64>,
    pub max_restarts: Option<usize>,
    pub stall_timeout_ms: Option<u64>,
}

impl StreamPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.discovery_window_ms == Some(0) || self.stall_timeout_ms == Some(0) {
            return Err(Error::validation("policy windows must be greater than zero"));
        }
        Ok(())
    }
}
