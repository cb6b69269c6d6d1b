//! Task domain types: one workflow instance and its lifecycle status.
//!
//! A task is an ordered list of stages plus a context payload threaded
//! between them. Status transitions are monotonic: `pending -> running ->
//! {completed | failed}`, with `cancelled` reachable only from `pending` or
//! `running`. A terminal task is immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::StageName;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Overall status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the monotonic state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One instance of a declared multi-stage workflow.
///
/// Mutated exclusively by the orchestrator; child rows (stage progress,
/// artifacts, messages) are owned by foreign key and deleted only by an
/// explicit purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// UUIDv7 task ID.
    pub id: Uuid,
    /// Name of the workflow this task instantiates.
    pub workflow_type: String,
    /// Ordered stage list.
    pub stages: Vec<StageName>,
    /// Index of the stage currently being executed (== `stages.len()` once
    /// every stage has completed).
    pub current_stage_index: usize,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Context payload threaded between stages; each stage's output may
    /// patch it.
    pub context: serde_json::Value,
    /// Submitting principal.
    pub owner: String,
    /// Extensible metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Human-readable error when the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// Bumped on every field mutation.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task at stage index 0.
    pub fn new(
        workflow_type: impl Into<String>,
        stages: Vec<StageName>,
        context: serde_json::Value,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_type: workflow_type.into(),
            stages,
            current_stage_index: 0,
            status: TaskStatus::Pending,
            context,
            owner: owner.into(),
            metadata: serde_json::Value::Object(Default::default()),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The stage at `current_stage_index`, or `None` once all stages ran.
    pub fn current_stage(&self) -> Option<StageName> {
        self.stages.get(self.current_stage_index).copied()
    }

    /// Whether the task is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completed fraction of the declared stages, as a whole percentage.
    pub fn progress_percent(&self) -> u8 {
        if self.stages.is_empty() {
            return 100;
        }
        ((self.current_stage_index as f64 / self.stages.len() as f64) * 100.0) as u8
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
