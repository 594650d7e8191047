//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use instance_store::StoreError;
use saga::{DefinitionError, SagaError};
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga engine error.
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::UnknownInstance { .. } | SagaError::UnknownProcessType(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        SagaError::Uncorrelated { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        SagaError::UnexpectedEvent { .. } => (StatusCode::CONFLICT, err.to_string()),
        SagaError::Store(StoreError::ConcurrencyConflict { .. }) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        SagaError::Store(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaError::EngineStopped => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        _ => {
            tracing::error!(error = %err, "saga engine error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

/// Errors that abort server startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to load saga definitions: {0}")]
    Definitions(#[from] DefinitionError),

    #[error("Failed to connect to the database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Instance store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Saga engine error: {0}")]
    Engine(#[from] SagaError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Saga engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
