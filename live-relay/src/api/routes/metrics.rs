//! Prometheus scrape endpoint.

use axum::{
    Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};

use crate::api::server::AppState;
use crate::metrics::PrometheusExporter;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(export_metrics))
}

/// Metrics as of the last health sweep.
async fn export_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = PrometheusExporter::new(state.relay.metrics().clone()).export();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
