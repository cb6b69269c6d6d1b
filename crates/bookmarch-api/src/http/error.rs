//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use bookmarch_types::error::OrchestratorError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Orchestration errors (invalid workflow, missing task, ...).
    Orchestrator(OrchestratorError),
    /// Request validation error.
    Validation(String),
    /// Resource not found.
    NotFound(String),
    /// Generic internal error.
    Internal(String),
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        AppError::Orchestrator(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Orchestrator(OrchestratorError::InvalidWorkflow(msg)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_WORKFLOW",
                msg.clone(),
            ),
            AppError::Orchestrator(OrchestratorError::TaskNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "TASK_NOT_FOUND",
                format!("Task {id} not found"),
            ),
            AppError::Orchestrator(OrchestratorError::InvalidTransition { from, to }) => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                format!("Cannot transition task from {from} to {to}"),
            ),
            AppError::Orchestrator(OrchestratorError::PurgeWhileRunning(id)) => (
                StatusCode::CONFLICT,
                "TASK_RUNNING",
                format!("Task {id} is running; cancel it before purging"),
            ),
            AppError::Orchestrator(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ORCHESTRATOR_ERROR",
                e.to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
