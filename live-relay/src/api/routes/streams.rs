//! Stream routes.

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::CallerIdentity;
use crate::api::models::{
    AttachConsumerRequest, CreateStreamRequest, CreateStreamResponse, ProducerSummary,
    StreamFilterParams, StreamResponse, StreamStatsResponse,
};
use crate::api::server::AppState;
use crate::domain::{Consumer, TransitionRecord};
use crate::health::StreamHealth;
use crate::router::AttachedConsumer;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_stream).get(list_streams))
        .route("/{id}", get(get_stream))
        .route("/{id}/stop", post(stop_stream))
        .route("/{id}/reconnect", post(reconnect_stream))
        .route("/{id}/stats", get(stream_stats))
        .route("/{id}/transitions", get(list_transitions))
        .route("/{id}/health", get(stream_health))
        .route("/{id}/consumers", get(list_consumers).post(attach_consumer))
}

fn response(state: &AppState, stream: &crate::domain::Stream) -> StreamResponse {
    let producer = state.relay.controller().producer(&stream.id);
    StreamResponse::new(stream, producer.as_ref())
}

/// Returns 201 for a new stream and 200 when an active stream for the same
/// source already exists.
pub async fn create_stream(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(request): Json<CreateStreamRequest>,
) -> ApiResult<(StatusCode, Json<CreateStreamResponse>)> {
    let outcome = state.relay.controller().create(
        &request.source,
        request.name.as_deref(),
        request.policy,
    )?;

    info!(
        caller = caller.label(),
        stream_id = %outcome.stream.id,
        reused = outcome.reused,
        "Create stream requested"
    );

    let status = if outcome.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(CreateStreamResponse {
            stream: response(&state, &outcome.stream),
            reused: outcome.reused,
        }),
    ))
}

pub async fn list_streams(
    State(state): State<AppState>,
    Query(params): Query<StreamFilterParams>,
) -> ApiResult<Json<Vec<StreamResponse>>> {
    let filter = params
        .parse_state()
        .map_err(|e| ApiError::validation(e).with_details(serde_json::json!({ "field": "state" })))?;
    let streams = state
        .relay
        .controller()
        .list(filter)
        .iter()
        .map(|s| response(&state, s))
        .collect();
    Ok(Json(streams))
}

pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamResponse>> {
    let stream = state.relay.controller().get(&id).await?;
    Ok(Json(response(&state, &stream)))
}

pub async fn stop_stream(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamResponse>> {
    info!(caller = caller.label(), stream_id = %id, "Stop stream requested");
    let stream = state.relay.controller().stop(&id).await?;
    Ok(Json(response(&state, &stream)))
}

/// Only a stream in `ERROR` without running ingestion is retried; the
/// response reflects the state at the time of the request.
pub async fn reconnect_stream(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamResponse>> {
    info!(caller = caller.label(), stream_id = %id, "Reconnect stream requested");
    let stream = state.relay.controller().reconnect(&id).await?;
    Ok(Json(response(&state, &stream)))
}

pub async fn stream_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamStatsResponse>> {
    let controller = state.relay.controller();
    let consumers = controller.consumer_stats(&id)?;
    let stream = controller
        .snapshot(&id)
        .ok_or_else(|| ApiError::not_found(format!("Stream with id '{id}' not found")))?;

    Ok(Json(StreamStatsResponse {
        stream_id: stream.id.clone(),
        state: stream.state,
        ingestion: controller.supervisor().handle(&id),
        producer: controller.producer(&id).as_ref().map(ProducerSummary::from),
        consumers,
    }))
}

pub async fn list_transitions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<TransitionRecord>>> {
    Ok(Json(state.relay.controller().transitions(&id).await?))
}

pub async fn stream_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamHealth>> {
    state
        .relay
        .monitor()
        .stream_health(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Stream with id '{id}' not found")))
}

pub async fn list_consumers(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Consumer>>> {
    Ok(Json(state.relay.controller().list_consumers(&id)?))
}

pub async fn attach_consumer(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
    Json(request): Json<AttachConsumerRequest>,
) -> ApiResult<(StatusCode, Json<AttachedConsumer>)> {
    let client_tag = request
        .client_tag
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| caller.label().to_string());

    let attached = state
        .relay
        .controller()
        .attach_consumer(&id, &client_tag, request.capabilities)
        .await?;

    info!(
        caller = caller.label(),
        stream_id = %id,
        consumer_id = %attached.consumer.id,
        "Consumer attached"
    );
    Ok((StatusCode::CREATED, Json(attached)))
}
