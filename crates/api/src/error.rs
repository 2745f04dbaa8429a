//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use replication::{ReplicationError, StoreError};

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Replication saga error.
    Replication(ReplicationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Replication(err) => replication_error_to_response(err),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, %status, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn replication_error_to_response(err: ReplicationError) -> (StatusCode, String) {
    let status = match &err {
        ReplicationError::InvalidEmail(_) => StatusCode::BAD_REQUEST,
        ReplicationError::EmailTaken(_) | ReplicationError::SagaAlreadyStarted(_) => {
            StatusCode::CONFLICT
        }
        ReplicationError::SagaNotFound(_) => StatusCode::NOT_FOUND,
        ReplicationError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
        ReplicationError::Store(store) if store.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        ReplicationError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
        ReplicationError::Store(_) | ReplicationError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<ReplicationError> for ApiError {
    fn from(err: ReplicationError) -> Self {
        ApiError::Replication(err)
    }
}
