//! HTTP error handling and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::repository::RepositoryError;
use crate::db::services::SubmitError;
use crate::services::job_queue::QueueError;

/// API error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Repository error
    Repository(RepositoryError),
    /// Job queue error
    Queue(QueueError),
}

impl AppError {
    fn status_and_body(self) -> (StatusCode, ApiError) {
        match self {
            AppError::Repository(e) => repository_status(&e),
            AppError::Queue(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError::new("QUEUE_ERROR", e.to_string()),
            ),
        }
    }
}

fn repository_status(e: &RepositoryError) -> (StatusCode, ApiError) {
    let msg = e.to_string();
    match e {
        RepositoryError::NotFound { .. } => (StatusCode::NOT_FOUND, ApiError::new("NOT_FOUND", msg)),
        RepositoryError::ValidationError { .. } => (
            StatusCode::BAD_REQUEST,
            ApiError::new("VALIDATION_ERROR", msg),
        ),
        RepositoryError::Conflict { .. } => (StatusCode::CONFLICT, ApiError::new("CONFLICT", msg)),
        RepositoryError::ConnectionError { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiError::new("REPOSITORY_UNAVAILABLE", msg),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::new("REPOSITORY_ERROR", msg),
        ),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_body();
        (status, Json(error)).into_response()
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        AppError::Repository(err)
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Repository(e) => AppError::Repository(e),
            SubmitError::Queue(e) => AppError::Queue(e),
        }
    }
}
