//! Stage capability handlers: the operator-facing registration table.
//!
//! GET lists the live registry view; PUT re-registers a stage's policy
//! (hot-reload) and persists the updated capability row. Retry and
//! rate-window changes take effect on the next decision; concurrency
//! ceilings are sized when the runtime starts.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use bookmarch_core::repository::capability::CapabilityRepository;
use bookmarch_types::stage::{StageCapability, StageName, StagePolicy};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/stages - List registered stage capabilities.
pub async fn list_stages(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<StageCapability>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let mut capabilities = state.orchestrator.registry().capabilities();
    capabilities.sort_by_key(|c| c.stage.as_str());

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(capabilities, request_id, elapsed)
        .with_link("self", "/api/v1/stages");
    Ok(Json(resp))
}

/// PUT /api/v1/stages/:name - Replace a stage's admission/retry policy.
pub async fn update_stage_policy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(policy): Json<StagePolicy>,
) -> Result<Json<ApiResponse<StageCapability>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let stage: StageName = name
        .parse()
        .map_err(|e: bookmarch_types::stage::UnknownStage| AppError::Validation(e.to_string()))?;

    let registry = state.orchestrator.registry();
    if !registry.update_policy(stage, policy) {
        return Err(AppError::NotFound(format!(
            "stage '{stage}' is not registered"
        )));
    }

    let entry = registry
        .get(stage)
        .ok_or_else(|| AppError::Internal("stage vanished during update".to_string()))?;
    state
        .capabilities
        .upsert_capability(&entry.capability)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    tracing::info!(stage = %stage, "stage policy re-registered");

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        entry.capability,
        request_id,
        elapsed,
    )))
}
