//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::server::AppState;
use crate::health::AggregateHealth;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

/// Aggregate health across all streams.
async fn health_check(State(state): State<AppState>) -> Json<AggregateHealth> {
    Json(state.relay.monitor().aggregate())
}

/// 503 once shutdown has begun.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.relay.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    } else {
        (StatusCode::OK, "ready")
    }
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}
