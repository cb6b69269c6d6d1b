//! WebSocket handler for real-time task progress streaming.
//!
//! `/ws/tasks/{id}/events` upgrades to a WebSocket delivering that task's
//! [`TaskEvent`]s as JSON text frames, in per-task order. Delivery is
//! best-effort: a slow client that lags the broadcast channel misses events
//! and should reconcile by re-reading the task, stage, and message
//! endpoints -- the push channel is an optimization, not the source of
//! truth. Disconnecting never affects task execution.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::state::AppState;

/// Upgrade an HTTP request to a WebSocket streaming one task's events.
pub async fn task_events(
    ws: WebSocketUpgrade,
    Path(task_id): Path<Uuid>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, task_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, task_id: Uuid) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut events = Box::pin(state.events.subscribe_task(task_id));

    tracing::debug!(%task_id, "progress stream subscriber connected");

    loop {
        tokio::select! {
            // --- Branch 1: forward task events to the client ---
            event = events.next() => {
                match event {
                    Some(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                                    // Client disconnected
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%task_id, error = %err, "failed to serialize task event");
                            }
                        }
                    }
                    // Event bus dropped (server shutting down)
                    None => break,
                }
            }

            // --- Branch 2: watch the client side for disconnect ---
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(%task_id, error = %err, "websocket receive error");
                        break;
                    }
                    // Ignore client frames; the stream is one-directional.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!(%task_id, "progress stream subscriber disconnected");
}
