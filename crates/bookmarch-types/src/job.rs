//! Queue job payloads and queue naming.
//!
//! One durable queue per stage (`tasks:{stage}`), plus a dead-letter queue
//! (`tasks:{stage}:dead`) receiving jobs whose retry budget is exhausted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::StageName;

/// The queue name for a stage's work.
pub fn queue_for(stage: StageName) -> String {
    format!("tasks:{stage}")
}

/// The dead-letter queue name for a stage.
pub fn dead_letter_for(stage: StageName) -> String {
    format!("tasks:{stage}:dead")
}

/// One unit of queued work: execute `stage` for `task_id`, attempt N.
///
/// Delivery is at-least-once; consumers must tolerate duplicates. Backoff
/// delays are expressed as a future `available_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    /// UUIDv7 job ID (doubles as the `job_ref` stored on StageProgress).
    pub id: Uuid,
    pub task_id: Uuid,
    pub stage: StageName,
    /// 1-based attempt number this job represents.
    pub attempt: u32,
    /// Opaque payload handed to the stage handler alongside the task context.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// The job must not be claimed before this instant.
    pub available_at: DateTime<Utc>,
}

impl QueueJob {
    /// A job available immediately (first attempt or explicit re-enqueue).
    pub fn immediate(task_id: Uuid, stage: StageName, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_id,
            stage,
            attempt,
            payload: serde_json::Value::Object(Default::default()),
            enqueued_at: now,
            available_at: now,
        }
    }

    /// A job delayed by the given backoff.
    pub fn delayed(task_id: Uuid, stage: StageName, attempt: u32, delay: std::time::Duration) -> Self {
        let mut job = Self::immediate(task_id, stage, attempt);
        job.available_at = job.enqueued_at
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        job
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
