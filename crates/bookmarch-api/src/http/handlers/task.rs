//! Task submission, status reads, and control handlers for the REST API.
//!
//! Submission returns immediately with the task id and a stream URL; all
//! execution happens asynchronously in the stage worker pools. The read
//! endpoints are the durable source of truth that streaming clients fall
//! back to after a disconnect.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bookmarch_core::repository::task::TaskRepository;
use bookmarch_types::artifact::Artifact;
use bookmarch_types::message::Message;
use bookmarch_types::stage::{StageName, StageProgress};
use bookmarch_types::task::{Task, TaskStatus};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// POST /tasks request body.
#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    /// Workflow preset name (also used as the task's type tag).
    pub workflow_type: String,
    /// Explicit stage list; omit to resolve from the preset.
    #[serde(default)]
    pub stages: Option<Vec<StageName>>,
    /// Initial context threaded between stages.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    /// Submitting principal.
    #[serde(default)]
    pub owner: Option<String>,
}

/// Summary returned on task creation.
#[derive(Debug, Serialize)]
pub struct TaskCreatedView {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: TaskStatus,
    pub stages: Vec<StageName>,
    pub progress: u8,
    pub stream_url: String,
}

/// Query parameters for listing tasks.
#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default = "default_task_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_task_limit() -> u32 {
    20
}

/// Query parameters for incremental message polling.
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Only messages with `timestamp > since` are returned.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/tasks - Submit a new task.
pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<ApiResponse<TaskCreatedView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let task = state
        .orchestrator
        .create_task(
            &body.workflow_type,
            body.stages,
            body.context.unwrap_or_else(|| serde_json::json!({})),
            body.owner.as_deref().unwrap_or("anonymous"),
        )
        .await?;

    let view = TaskCreatedView {
        id: task.id,
        workflow_type: task.workflow_type.clone(),
        status: task.status,
        stages: task.stages.clone(),
        progress: task.progress_percent(),
        stream_url: format!("/ws/tasks/{}/events", task.id),
    };

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(view, request_id, elapsed)
        .with_link("self", &format!("/api/v1/tasks/{}", task.id))
        .with_link("messages", &format!("/api/v1/tasks/{}/messages", task.id));
    Ok(Json(resp))
}

/// GET /api/v1/tasks - List tasks, newest first.
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ApiResponse<Vec<Task>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let tasks = state
        .orchestrator
        .repository()
        .list_tasks(query.limit.min(100), query.offset)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(tasks, request_id, elapsed).with_link("self", "/api/v1/tasks");
    Ok(Json(resp))
}

/// GET /api/v1/tasks/:id - Task status.
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Task>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let task = state
        .orchestrator
        .repository()
        .get_task(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("Task {id} not found")))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(task, request_id, elapsed)
        .with_link("self", &format!("/api/v1/tasks/{id}"))
        .with_link("stages", &format!("/api/v1/tasks/{id}/stages"))
        .with_link("artifacts", &format!("/api/v1/tasks/{id}/artifacts"))
        .with_link("messages", &format!("/api/v1/tasks/{id}/messages"));
    Ok(Json(resp))
}

/// GET /api/v1/tasks/:id/stages - Per-stage execution records.
pub async fn get_stages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<StageProgress>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    ensure_task_exists(&state, &id).await?;
    let stages = state
        .orchestrator
        .repository()
        .list_stages(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(stages, request_id, elapsed)))
}

/// GET /api/v1/tasks/:id/artifacts - Stage outputs, ordered by creation.
pub async fn get_artifacts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<Artifact>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    ensure_task_exists(&state, &id).await?;
    let artifacts = state
        .orchestrator
        .repository()
        .list_artifacts(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(artifacts, request_id, elapsed)))
}

/// GET /api/v1/tasks/:id/messages?since=T - Audit trail, incremental.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<ApiResponse<Vec<Message>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    ensure_task_exists(&state, &id).await?;
    let messages = state
        .orchestrator
        .repository()
        .list_messages(&id, query.since)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(messages, request_id, elapsed)))
}

/// POST /api/v1/tasks/:id/cancel - Cancel a pending or running task.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Task>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let task = state.orchestrator.cancel(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(task, request_id, elapsed)))
}

/// DELETE /api/v1/tasks/:id - Purge a task and everything it owns.
pub async fn purge_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.orchestrator.purge(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        serde_json::json!({"purged": id}),
        request_id,
        elapsed,
    )))
}

async fn ensure_task_exists(state: &AppState, id: &Uuid) -> Result<(), AppError> {
    state
        .orchestrator
        .repository()
        .get_task(id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(format!("Task {id} not found")))
}
