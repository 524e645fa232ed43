//! API error handling.
//!
//! Domain errors are mapped to an HTTP status and a JSON body carrying the
//! error's stable code.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

/// HTTP status for a domain error.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidStateTransition { .. }
        | Error::StreamNotLive { .. }
        | Error::RetryExhausted { .. } => StatusCode::CONFLICT,
        Error::Validation(_)
        | Error::Configuration(_)
        | Error::Handshake(_)
        | Error::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::BoundaryRejected { .. } | Error::Boundary(_) => StatusCode::BAD_GATEWAY,
        Error::Persistence(_) | Error::DatabaseSqlx(_) | Error::Migration(_) | Error::Shutdown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Timeout { .. } | Error::DiscoveryTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Io(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = status_for(&err);
        let message = match &err {
            Error::DatabaseSqlx(_) | Error::Migration(_) | Error::Io(_) | Error::Other(_) => {
                tracing::error!(error = %err, "Internal error while handling request");
                "An internal error occurred".to_string()
            }
            _ => err.to_string(),
        };
        ApiError::new(status, err.code(), message)
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
