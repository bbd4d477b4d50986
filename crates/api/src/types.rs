//! Request and response types for the pipeline API

use analytics_common::{PipelineError, RunId, RunStatus};
use axum::{http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to start a pipeline run
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    /// Uploaded file the run analyses
    pub file_id: String,

    /// The user's question about the dataset
    pub query: String,
}

/// Response when a run has been started or retried
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,

    /// WebSocket URL streaming the run's events
    pub stream_url: String,

    pub status: RunStatus,

    /// Set when the run retries an earlier one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<RunId>,
}

/// Result of a pause/resume/cancel request
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Query string of the stream endpoint
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Last sequence number the client has seen
    pub from: Option<u64>,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub runs: usize,
    pub timestamp: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Machine-readable error code
    pub code: Option<String>,

    pub timestamp: DateTime<Utc>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
            timestamp: Utc::now(),
        }
    }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::RunNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidStateTransition { .. } | PipelineError::ResultsNotReady { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a pipeline error onto the JSON error body
pub fn error_response(err: PipelineError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    }
    (status, Json(ErrorResponse::new(err.to_string(), err.code())))
}
