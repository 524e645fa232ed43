//! API route modules.

pub mod consumers;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod streams;

use axum::{Router, middleware};

use crate::api::middleware::caller_identity;
use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/streams", streams::router())
        .nest("/api/consumers", consumers::router())
        .nest("/api/logging", logging::router())
        .nest("/health", health::router())
        .nest("/metrics", metrics::router())
        .layer(middleware::from_fn(caller_identity))
        .with_state(state)
}
