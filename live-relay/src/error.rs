//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Stream {stream_id} is not live (current state: {state})")]
    StreamNotLive { stream_id: String, state: String },

    #[error("Routing boundary rejected {operation}: {reason}")]
    BoundaryRejected { operation: String, reason: String },

    #[error("Routing boundary error: {0}")]
    Boundary(String),

    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("No source identifier observed within {window_ms}ms")]
    DiscoveryTimeout { window_ms: u64 },

    #[error("Ingestion for stream {stream_id} exhausted its restart budget ({failures} failures)")]
    RetryExhausted { stream_id: String, failures: usize },

    #[error("Viewer handshake failed: {0}")]
    Handshake(String),

    #[error("Persistence unavailable: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Relay is shutting down")]
    Shutdown,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BoundaryRejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::StreamNotLive { .. } => "stream_not_live",
            Self::BoundaryRejected { .. } => "boundary_rejected",
            Self::Boundary(_) => "boundary_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::DiscoveryTimeout { .. } => "discovery_timeout",
            Self::RetryExhausted { .. } => "ingestion_retry_exhausted",
            Self::Handshake(_) => "handshake_failed",
            Self::Persistence(_) | Self::DatabaseSqlx(_) | Self::Migration(_) => {
                "persistence_unavailable"
            }
            Self::Serialization(_) => "serialization_error",
            Self::Validation(_) => "validation_error",
            Self::Configuration(_) => "configuration_error",
            Self::Io(_) => "io_error",
            Self::Shutdown => "shutting_down",
            Self::Other(_) => "internal_error",
        }
    }
}
