//! Relay container.
//!
//! Owns every service and its background tasks. Constructed explicitly and
//! torn down explicitly with [`Relay::shutdown`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::RelayConfig;
use crate::consumer::{ConsumerSessionRegistry, SessionCloser};
use crate::controller::StreamController;
use crate::domain::Consumer;
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use crate::ingest::{FfmpegEngine, IngestEngine, IngestionSupervisor};
use crate::persistence::{
    MemoryRepository, PersistenceWriter, RetryPolicy, SqliteRepository, StreamRepository,
};
use crate::router::{LoopbackBoundary, RouterGateway, RoutingBoundary, WsBoundary};

/// Closes evicted sessions on the boundary and records the closed consumer.
struct EvictionCloser {
    gateway: Arc<RouterGateway>,
    writer: Arc<PersistenceWriter>,
}

#[async_trait]
impl SessionCloser for EvictionCloser {
    async fn close_session(&self, consumer: &Consumer) -> Result<()> {
        self.writer.consumer(consumer);
        self.gateway.close_session(consumer).await
    }
}

pub struct Relay {
    config: RelayConfig,
    controller: Arc<StreamController>,
    monitor: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    registry: Arc<ConsumerSessionRegistry>,
    gateway: Arc<RouterGateway>,
    writer: Arc<PersistenceWriter>,
    repository: Arc<dyn StreamRepository>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        engine: Arc<dyn IngestEngine>,
        boundary: Arc<dyn RoutingBoundary>,
        repository: Arc<dyn StreamRepository>,
    ) -> Self {
        let registry = Arc::new(ConsumerSessionRegistry::new(config.consumers.clone()));
        let gateway = Arc::new(RouterGateway::new(
            boundary,
            registry.clone(),
            config.router.request_timeout(),
        ));
        let supervisor = Arc::new(IngestionSupervisor::new(config.ingest.clone(), engine));
        let writer = Arc::new(PersistenceWriter::spawn(
            repository.clone(),
            RetryPolicy::from(&config.persistence),
        ));
        let controller = Arc::new(StreamController::new(
            config.controller.clone(),
            supervisor,
            gateway.clone(),
            registry.clone(),
            writer.clone(),
            repository.clone(),
        ));
        let metrics = Arc::new(MetricsCollector::new());
        let monitor = Arc::new(HealthMonitor::new(
            controller.clone(),
            config.health.clone(),
            metrics.clone(),
        ));

        Self {
            config,
            controller,
            monitor,
            metrics,
            registry,
            gateway,
            writer,
            repository,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a relay from configuration: sqlite or memory persistence,
    /// WebSocket or loopback boundary, and the ffmpeg engine.
    pub async fn from_config(config: RelayConfig) -> Result<Self> {
        let repository: Arc<dyn StreamRepository> = if config.persistence.is_memory() {
            info!("Using in-memory persistence");
            Arc::new(MemoryRepository::new())
        } else {
            Arc::new(SqliteRepository::connect(&config.persistence).await?)
        };

        let boundary: Arc<dyn RoutingBoundary> = match &config.router.url {
            Some(url) => {
                info!(url = %url, "Using WebSocket routing boundary");
                Arc::new(WsBoundary::new(url.clone()))
            }
            None => {
                info!("Using loopback routing boundary");
                Arc::new(LoopbackBoundary::new(config.router.observe_grace()))
            }
        };

        let engine = FfmpegEngine::detect(&config.ingest).await;
        match engine.version() {
            Some(version) => info!(version = %version, "Using ffmpeg"),
            None => warn!(
                path = %config.ingest.ffmpeg_path,
                "ffmpeg not found; streams will fail to start ingestion"
            ),
        }
        Ok(Self::new(config, Arc::new(engine), boundary, repository))
    }

    /// Spawn the consumer sweeper and the health monitor.
    pub fn start(&self) {
        let closer = Arc::new(EvictionCloser {
            gateway: self.gateway.clone(),
            writer: self.writer.clone(),
        });
        let mut tasks = self.tasks.lock();
        tasks.push(self.registry.spawn_sweeper(closer, self.cancel.child_token()));
        tasks.push(self.monitor.spawn(self.cancel.child_token()));
        info!(
            boundary = self.gateway.boundary_name(),
            engine = self.controller.supervisor().engine_name(),
            "Relay started"
        );
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<StreamController> {
        &self.controller
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ConsumerSessionRegistry> {
        &self.registry
    }

    pub fn writer(&self) -> &Arc<PersistenceWriter> {
        &self.writer
    }

    pub fn repository(&self) -> &Arc<dyn StreamRepository> {
        &self.repository
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop every stream, then the background tasks, then drain persistence.
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.controller.shutdown().await;
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let pending = self.writer.flush().await;
        if pending > 0 {
            warn!(pending, "Shutting down with unwritten records");
        }
        self.writer.shutdown().await;
        info!("Relay shut down");
    }
}
