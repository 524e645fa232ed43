//! Consumer routes.

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
};
use tracing::info;

use crate::api::error::ApiResult;
use crate::api::middleware::CallerIdentity;
use crate::api::models::ConnectConsumerRequest;
use crate::api::server::AppState;
use crate::domain::Consumer;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", delete(detach_consumer))
        .route("/{id}/connect", post(connect_consumer))
        .route("/{id}/heartbeat", post(heartbeat))
        .route("/{id}/evict", post(evict_consumer))
}

pub async fn connect_consumer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ConnectConsumerRequest>,
) -> ApiResult<Json<Consumer>> {
    let consumer = state
        .relay
        .controller()
        .complete_handshake(&id, &request.handshake)
        .await?;
    Ok(Json(consumer))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Consumer>> {
    Ok(Json(state.relay.controller().heartbeat(&id)?))
}

/// Close a viewer session from the operator side. Unlike detach, an
/// unknown or already closed consumer is a 404.
pub async fn evict_consumer(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Consumer>> {
    info!(caller = caller.label(), consumer_id = %id, "Evict consumer requested");
    Ok(Json(state.relay.controller().evict_consumer(&id).await?))
}

/// Detaching an unknown or already closed consumer succeeds.
pub async fn detach_consumer(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.relay.controller().detach_consumer(&id).await.is_some() {
        info!(caller = caller.label(), consumer_id = %id, "Consumer detached");
    }
    StatusCode::NO_CONTENT
}
