use thiserror::Error;
use uuid::Uuid;

use crate::stage::StageName;
use crate::task::TaskStatus;

/// Errors raised by the orchestrator's sequencing operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Empty stage list, or a stage with no registered handler. Rejected
    /// synchronously at submission; no task row is created.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// A worker's result arrived for a stage the task has already moved
    /// past, or for a task no longer live. Callers discard this silently;
    /// it is never surfaced to users.
    #[error("stale advancement for task {task_id} at stage {stage}")]
    StaleAdvancement { task_id: Uuid, stage: StageName },

    /// A task cannot be purged while still running.
    #[error("task {0} is running; cancel before purging")]
    PurgeWhileRunning(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors raised by stage handlers (the pluggable business logic).
///
/// The default retry policy does not distinguish variants -- every handler
/// failure is retried up to the attempt ceiling.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage handler error: {0}")]
    Handler(String),

    #[error("invalid stage input: {0}")]
    InvalidInput(String),

    #[error("downstream service unavailable: {0}")]
    Unavailable(String),
}

/// Errors from repository operations (used by trait definitions in
/// bookmarch-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// A conditional write matched no row: another writer won the race or
    /// the target is immutable (e.g. a duplicate artifact insert).
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the queue broker adapter.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("malformed job payload: {0}")]
    MalformedJob(String),
}
