//! Task-family repository trait definition.
//!
//! Covers the four task-owned entity families -- tasks, per-stage progress,
//! artifacts, and messages -- behind one storage interface. Ownership is
//! strictly one-directional: children carry the owning task id and nothing
//! else; purging a task cascades downward.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use bookmarch_types::artifact::Artifact;
use bookmarch_types::error::RepositoryError;
use bookmarch_types::message::Message;
use bookmarch_types::stage::{StageName, StageProgress};
use bookmarch_types::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository trait for task persistence.
///
/// # Concurrency contract
///
/// `update_task_status` and `advance_task` are conditional writes scoped to
/// a single task: the update applies only if the task still matches the
/// expected status (and stage index, for advancement). When the condition
/// fails the method returns `RepositoryError::Conflict` and the caller
/// treats the write as a stale advancement. Combined with the worker-side
/// stage-index guard this enforces at-most-once advancement per stage.
pub trait TaskRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Atomically create a task together with its first stage-progress row.
    fn create_task(
        &self,
        task: &Task,
        first_stage: &StageProgress,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a task by id.
    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// List tasks, newest first.
    fn list_tasks(
        &self,
        limit: u32,
        offset: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Count tasks currently in the given status.
    fn count_tasks_with_status(
        &self,
        status: TaskStatus,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Conditionally set a task's status.
    ///
    /// The write applies only while the task's current status is in
    /// `expected`; otherwise `Conflict`. `error` is recorded as the task's
    /// `error_message` when present.
    fn update_task_status(
        &self,
        id: &Uuid,
        expected: &[TaskStatus],
        next: TaskStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Conditionally advance `current_stage_index` from `from_index` to
    /// `from_index + 1`, setting `status` in the same write. Applies only
    /// while the task is `pending` or `running` and the index still equals
    /// `from_index`; otherwise `Conflict`.
    fn advance_task(
        &self,
        id: &Uuid,
        from_index: usize,
        status: TaskStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the task's context payload (after applying a stage's patch).
    fn update_task_context(
        &self,
        id: &Uuid,
        context: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a task and cascade to its stage progress, artifacts, messages,
    /// and queued jobs. Returns `true` if the task existed.
    fn purge_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Stage progress
    // -----------------------------------------------------------------------

    /// Insert a fresh stage-progress row (idempotent upsert keyed by
    /// `(task_id, stage)` so duplicate enqueues are harmless).
    fn upsert_stage(
        &self,
        row: &StageProgress,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get one stage-progress row.
    fn get_stage(
        &self,
        task_id: &Uuid,
        stage: StageName,
    ) -> impl std::future::Future<Output = Result<Option<StageProgress>, RepositoryError>> + Send;

    /// List all stage-progress rows for a task, in stage order.
    fn list_stages(
        &self,
        task_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StageProgress>, RepositoryError>> + Send;

    /// Mark a stage running: set `started_at` (first attempt only),
    /// `attempts = attempt`, and record the claiming job's ref.
    fn mark_stage_running(
        &self,
        task_id: &Uuid,
        stage: StageName,
        attempt: u32,
        job_ref: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark a stage completed, optionally storing final progress data.
    fn mark_stage_completed(
        &self,
        task_id: &Uuid,
        stage: StageName,
        progress_data: Option<&serde_json::Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark a stage terminally failed with its last error.
    fn mark_stage_failed(
        &self,
        task_id: &Uuid,
        stage: StageName,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Park a failed stage back to pending for a retry, recording the error
    /// and the re-enqueued job's ref.
    fn mark_stage_retrying(
        &self,
        task_id: &Uuid,
        stage: StageName,
        error: &str,
        job_ref: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Count stage-progress rows currently `running` for a stage type,
    /// across all tasks.
    fn count_running_stages(
        &self,
        stage: StageName,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Insert an artifact. Artifacts are write-once: inserting an id that
    /// already exists returns `Conflict` and leaves the stored row intact.
    fn insert_artifact(
        &self,
        artifact: &Artifact,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List a task's artifacts ordered by `created_at`.
    fn list_artifacts(
        &self,
        task_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Artifact>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append a message. Messages are never updated or deleted
    /// independently of their task.
    fn append_message(
        &self,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List a task's messages ordered by `(timestamp, id)`. With `since`,
    /// only messages with `timestamp > since` are returned (strict, for
    /// incremental polling).
    fn list_messages(
        &self,
        task_id: &Uuid,
        since: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, RepositoryError>> + Send;
}
