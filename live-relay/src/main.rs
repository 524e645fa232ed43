use std::sync::Arc;

use anyhow::Context;
use live_relay::api::{ApiServer, AppState};
use live_relay::config::RelayConfig;
use live_relay::{Relay, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::load().context("failed to load configuration")?;

    let logging_config =
        logging::init_logging(&config.logging).context("failed to initialize logging")?;

    let relay = Arc::new(
        Relay::from_config(config.clone())
            .await
            .context("failed to build relay")?,
    );
    relay.start();
    logging_config.start_retention_cleanup(relay.cancellation_token());

    let state = AppState::new(relay.clone()).with_logging_config(logging_config.clone());
    let server = ApiServer::new(config.api.clone(), state);
    let server_token = server.cancel_token();

    let server_task = tokio::spawn(async move { server.run().await });

    tracing::info!("live-relay initialized successfully");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    server_token.cancel();
    match server_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "API server failed"),
        Err(e) => tracing::error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }
    relay.shutdown().await;

    Ok(())
}
