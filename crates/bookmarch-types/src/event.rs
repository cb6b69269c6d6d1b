//! Event types for the task progress broadcast bus.
//!
//! `TaskEvent` is the unified event type published on every task, stage, and
//! message mutation. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels. Delivery is best-effort and ordered per task; the
//! durable stores remain the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::MessageKind;
use crate::stage::StageName;
use crate::task::TaskStatus;

/// Events emitted during task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was created and its first stage enqueued.
    TaskCreated {
        task_id: Uuid,
        workflow_type: String,
        stages: Vec<StageName>,
        timestamp: DateTime<Utc>,
    },

    /// The task's overall status changed.
    TaskStatusChanged {
        task_id: Uuid,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
    },

    /// A worker began executing a stage.
    StageStarted {
        task_id: Uuid,
        stage: StageName,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A stage completed successfully.
    StageCompleted {
        task_id: Uuid,
        stage: StageName,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A stage attempt failed.
    StageFailed {
        task_id: Uuid,
        stage: StageName,
        attempt: u32,
        error: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },

    /// A failed stage was re-enqueued with backoff.
    StageRetrying {
        task_id: Uuid,
        stage: StageName,
        next_attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An artifact was persisted.
    ArtifactStored {
        task_id: Uuid,
        stage: StageName,
        artifact_id: Uuid,
        artifact_type: String,
        timestamp: DateTime<Utc>,
    },

    /// A message was appended to the task's audit trail.
    MessageAppended {
        task_id: Uuid,
        message_id: Uuid,
        kind: MessageKind,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    /// The task this event belongs to, for per-task subscription filtering.
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::TaskCreated { task_id, .. }
            | TaskEvent::TaskStatusChanged { task_id, .. }
            | TaskEvent::StageStarted { task_id, .. }
            | TaskEvent::StageCompleted { task_id, .. }
            | TaskEvent::StageFailed { task_id, .. }
            | TaskEvent::StageRetrying { task_id, .. }
            | TaskEvent::ArtifactStored { task_id, .. }
            | TaskEvent::MessageAppended { task_id, .. } => *task_id,
        }
    }
}
