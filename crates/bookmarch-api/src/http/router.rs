//! Axum router configuration with middleware.
//!
//! REST routes live under `/api/v1/`; the per-task progress stream is a
//! WebSocket at `/ws/tasks/{id}/events`; `/health` serves the latest
//! health-monitor snapshot. Middleware: CORS and request tracing.

use axum::routing::{get, post, put};
use axum::{Json, Router};
use axum::extract::State;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Task submission and reads
        .route(
            "/tasks",
            post(handlers::task::create_task).get(handlers::task::list_tasks),
        )
        .route(
            "/tasks/{id}",
            get(handlers::task::get_task).delete(handlers::task::purge_task),
        )
        .route("/tasks/{id}/stages", get(handlers::task::get_stages))
        .route("/tasks/{id}/artifacts", get(handlers::task::get_artifacts))
        .route("/tasks/{id}/messages", get(handlers::task::get_messages))
        .route("/tasks/{id}/cancel", post(handlers::task::cancel_task))
        // Stage capability registry (operator-facing)
        .route("/stages", get(handlers::capability::list_stages))
        .route(
            "/stages/{name}",
            put(handlers::capability::update_stage_policy),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/tasks/{id}/events", get(handlers::ws::task_events))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Latest health snapshot (no auth required).
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.health.borrow().clone();
    match snapshot {
        Some(snapshot) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "snapshot": snapshot,
        })),
        None => Json(serde_json::json!({
            "status": "starting",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    }
}
