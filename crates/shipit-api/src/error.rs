//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use shipit_db::DbError;
use shipit_scheduler::QueueError;

/// Body of a failed submission, kept stable for existing clients.
pub const QUEUE_FAILURE_MESSAGE: &str = "Failed to queue the job";

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// The job could not be stored or enqueued.
    QueueFailed(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::QueueFailed(_) => {
                let body = Json(json!({
                    "status": "error",
                    "message": QUEUE_FAILURE_MESSAGE,
                }));
                return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
            }
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<shipit_core::Error> for ApiError {
    fn from(err: shipit_core::Error) -> Self {
        match err {
            shipit_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            shipit_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            shipit_core::Error::Duplicate(msg) => ApiError::Conflict(msg),
            shipit_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => ApiError::NotFound(msg),
            DbError::Duplicate(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::AlreadyQueued(id) => {
                ApiError::Conflict(format!("build {} is already queued", id))
            }
            _ => ApiError::QueueFailed(err.to_string()),
        }
    }
}
