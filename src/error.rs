//! Error taxonomy for patching jobs and the HTTP surface
//!
//! Computation code propagates `anyhow::Error`; anything that has to be
//! classified later (validation, remote connectivity, cancellation) is
//! raised as a [`PatchError`] so the job runner and the router can
//! downcast and react.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// Malformed request, rejected before any computation starts
    #[error("Validation error: {0}")]
    Validation(String),

    /// The remote execution backend could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote execution backend reported a failed job
    #[error("Remote job failed: {0}")]
    Remote(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The listener went away and the computation was abandoned
    #[error("Job cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Error returned by HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("Internal Server Error: {0}")]
    Any(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::Patch(PatchError::Validation(s)) => (StatusCode::UNPROCESSABLE_ENTITY, s),
            ApiError::Patch(e @ (PatchError::UnknownModel(_) | PatchError::JobNotFound(_))) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            ApiError::Patch(e) => {
                tracing::error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ApiError::Any(e) => {
                // Validation raised deep inside tokenization/alignment still
                // surfaces as a synchronous rejection.
                if let Some(PatchError::Validation(s)) = e.downcast_ref::<PatchError>() {
                    (StatusCode::UNPROCESSABLE_ENTITY, s.clone())
                } else {
                    tracing::error!("Internal Error: {:#}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
            }
        };

        (status, Json(json!({ "error": msg }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
