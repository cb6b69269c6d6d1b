//! The workflow orchestrator: creates tasks, sequences stages, and drives
//! every task to a terminal status.
//!
//! All task mutations flow through this type. Advancement is linearized by
//! the repository's conditional writes: the compare-and-swap on
//! `current_stage_index` is the single point where one of two racing
//! workers wins; the loser observes `Conflict` and its result is discarded
//! (a stale advancement, invisible to users). Artifacts, context patches,
//! and the next stage's enqueue happen only on the winning side, after the
//! swap.

use std::sync::Arc;

use bookmarch_types::artifact::Artifact;
use bookmarch_types::error::{OrchestratorError, RepositoryError};
use bookmarch_types::event::TaskEvent;
use bookmarch_types::job::{dead_letter_for, queue_for, QueueJob};
use bookmarch_types::message::Message;
use bookmarch_types::stage::{StageName, StageProgress, StageStatus};
use bookmarch_types::task::{Task, TaskStatus};
use chrono::Utc;
use uuid::Uuid;

use crate::event::TaskEventBus;
use crate::queue::JobQueue;
use crate::repository::TaskRepository;
use crate::retry::{RetryController, RetryDecision};
use crate::stage::handler::StageOutput;
use crate::stage::registry::StageRegistry;

/// Orchestrates multi-stage task execution over a repository and a queue
/// broker.
pub struct Orchestrator<R: TaskRepository, Q: JobQueue> {
    repository: Arc<R>,
    queue: Arc<Q>,
    registry: Arc<StageRegistry>,
    events: TaskEventBus,
}

impl<R: TaskRepository, Q: JobQueue> Orchestrator<R, Q> {
    pub fn new(
        repository: Arc<R>,
        queue: Arc<Q>,
        registry: Arc<StageRegistry>,
        events: TaskEventBus,
    ) -> Self {
        Self {
            repository,
            queue,
            registry,
            events,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &TaskEventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Create a task and enqueue its first stage.
    ///
    /// `stages` may be omitted when `workflow_type` names a registered
    /// workflow preset. Every stage must have a registered handler;
    /// otherwise the submission is rejected synchronously with
    /// `InvalidWorkflow` and no task row is created. Returns as soon as the
    /// first job is enqueued -- execution is asynchronous.
    pub async fn create_task(
        &self,
        workflow_type: &str,
        stages: Option<Vec<StageName>>,
        context: serde_json::Value,
        owner: &str,
    ) -> Result<Task, OrchestratorError> {
        let stages = match stages {
            Some(stages) => stages,
            None => self.registry.resolve_workflow(workflow_type).ok_or_else(|| {
                OrchestratorError::InvalidWorkflow(format!(
                    "unknown workflow type: '{workflow_type}'"
                ))
            })?,
        };

        if stages.is_empty() {
            return Err(OrchestratorError::InvalidWorkflow(
                "stage list is empty".to_string(),
            ));
        }
        for stage in &stages {
            if !self.registry.contains(*stage) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "no handler registered for stage '{stage}'"
                )));
            }
        }

        let task = Task::new(workflow_type, stages.clone(), context, owner);
        let first_stage = stages[0];
        let job = QueueJob::immediate(task.id, first_stage, 1);

        let mut progress = StageProgress::pending(task.id, first_stage, 0);
        progress.job_ref = Some(job.id.to_string());

        self.repository.create_task(&task, &progress).await?;
        self.queue.enqueue(&queue_for(first_stage), &job).await?;

        self.events.publish(TaskEvent::TaskCreated {
            task_id: task.id,
            workflow_type: task.workflow_type.clone(),
            stages,
            timestamp: Utc::now(),
        });
        self.append_message(Message::info(
            task.id,
            &format!("task created ({})", task.workflow_type),
        ))
        .await?;

        tracing::info!(task_id = %task.id, workflow = workflow_type, "task created");
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Worker-facing operations
    // -----------------------------------------------------------------------

    /// Admit a claimed job for execution.
    ///
    /// Re-checks that the task is still live and that the job's stage is
    /// still the current one -- the guard against stale or duplicate
    /// deliveries racing a cancellation or a later stage. Returns the task
    /// (with stage marked running) or `None` when the job must be
    /// discarded.
    pub async fn begin_stage(&self, job: &QueueJob) -> Result<Option<Task>, OrchestratorError> {
        let Some(mut task) = self.repository.get_task(&job.task_id).await? else {
            tracing::debug!(task_id = %job.task_id, "job for purged task discarded");
            return Ok(None);
        };

        if task.is_terminal() || task.current_stage() != Some(job.stage) {
            tracing::debug!(
                task_id = %task.id,
                stage = %job.stage,
                status = %task.status,
                "stale job delivery discarded"
            );
            return Ok(None);
        }

        if let Some(row) = self.repository.get_stage(&task.id, job.stage).await? {
            if row.status == StageStatus::Completed {
                return Ok(None);
            }
        }

        if task.status == TaskStatus::Pending {
            match self
                .repository
                .update_task_status(&task.id, &[TaskStatus::Pending], TaskStatus::Running, None)
                .await
            {
                Ok(()) => {
                    task.status = TaskStatus::Running;
                    self.events.publish(TaskEvent::TaskStatusChanged {
                        task_id: task.id,
                        status: TaskStatus::Running,
                        timestamp: Utc::now(),
                    });
                }
                // Another worker (or a cancel) transitioned first. Re-check
                // liveness; only proceed if the task is now running.
                Err(RepositoryError::Conflict(_)) => {
                    let Some(current) = self.repository.get_task(&task.id).await? else {
                        return Ok(None);
                    };
                    if current.status != TaskStatus::Running
                        || current.current_stage() != Some(job.stage)
                    {
                        return Ok(None);
                    }
                    task = current;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.repository
            .mark_stage_running(&task.id, job.stage, job.attempt, &job.id.to_string())
            .await?;

        self.events.publish(TaskEvent::StageStarted {
            task_id: task.id,
            stage: job.stage,
            attempt: job.attempt,
            timestamp: Utc::now(),
        });

        Ok(Some(task))
    }

    /// Record a successful stage execution and advance the task.
    ///
    /// The conditional index swap is performed first; on `Conflict` the
    /// entire result is discarded with no state change (duplicate delivery
    /// after a retry already succeeded, or a cancellation won the race).
    pub async fn advance_on_success(
        &self,
        task_id: Uuid,
        stage: StageName,
        duration_ms: u64,
        output: StageOutput,
    ) -> Result<(), OrchestratorError> {
        let Some(task) = self.live_task_at_stage(task_id, stage).await? else {
            return Ok(());
        };

        let from_index = task.current_stage_index;
        let next_index = from_index + 1;
        let finished = next_index >= task.stages.len();
        let next_status = if finished {
            TaskStatus::Completed
        } else {
            TaskStatus::Running
        };

        match self
            .repository
            .advance_task(&task_id, from_index, next_status)
            .await
        {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                tracing::debug!(%task_id, %stage, "lost advancement race, result discarded");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // We won the swap: persist the result.
        let artifact = Artifact::new(
            task_id,
            stage,
            &output.artifact_type,
            &output.content_type,
            output.artifact,
        );
        let artifact_id = artifact.id;
        let artifact_type = artifact.artifact_type.clone();
        self.repository.insert_artifact(&artifact).await?;

        if let Some(patch) = output.context_patch {
            let merged = merge_context(task.context.clone(), patch);
            self.repository.update_task_context(&task_id, &merged).await?;
        }

        self.repository
            .mark_stage_completed(&task_id, stage, None)
            .await?;

        self.events.publish(TaskEvent::ArtifactStored {
            task_id,
            stage,
            artifact_id,
            artifact_type,
            timestamp: Utc::now(),
        });
        self.events.publish(TaskEvent::StageCompleted {
            task_id,
            stage,
            duration_ms,
            timestamp: Utc::now(),
        });
        self.append_message(Message::completion(
            task_id,
            Some(stage),
            &format!("stage {stage} completed"),
        ))
        .await?;

        if finished {
            self.events.publish(TaskEvent::TaskStatusChanged {
                task_id,
                status: TaskStatus::Completed,
                timestamp: Utc::now(),
            });
            self.append_message(Message::completion(task_id, None, "workflow completed"))
                .await?;
            tracing::info!(%task_id, "task completed");
        } else {
            let next_stage = task.stages[next_index];
            let job = QueueJob::immediate(task_id, next_stage, 1);
            let mut progress = StageProgress::pending(task_id, next_stage, next_index);
            progress.job_ref = Some(job.id.to_string());

            self.repository.upsert_stage(&progress).await?;
            self.queue.enqueue(&queue_for(next_stage), &job).await?;
            tracing::debug!(%task_id, stage = %next_stage, "next stage enqueued");
        }

        Ok(())
    }

    /// Record a failed stage attempt: re-enqueue with backoff while the
    /// attempt ceiling allows, otherwise fail the stage and the task.
    pub async fn advance_on_failure(
        &self,
        task_id: Uuid,
        stage: StageName,
        attempt: u32,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        let Some(task) = self.live_task_at_stage(task_id, stage).await? else {
            return Ok(());
        };

        let retry_settings = self
            .registry
            .policy(stage)
            .map(|p| p.retry)
            .unwrap_or_default();

        match RetryController::decide(&retry_settings, attempt) {
            RetryDecision::Retry { delay } => {
                let next_attempt = attempt + 1;
                let job = QueueJob::delayed(task_id, stage, next_attempt, delay);

                self.repository
                    .mark_stage_retrying(&task_id, stage, error, &job.id.to_string())
                    .await?;
                self.queue.enqueue(&queue_for(stage), &job).await?;

                self.events.publish(TaskEvent::StageFailed {
                    task_id,
                    stage,
                    attempt,
                    error: error.to_string(),
                    will_retry: true,
                    timestamp: Utc::now(),
                });
                self.events.publish(TaskEvent::StageRetrying {
                    task_id,
                    stage,
                    next_attempt,
                    delay_ms: delay.as_millis() as u64,
                    timestamp: Utc::now(),
                });
                self.append_message(Message::warning(
                    task_id,
                    Some(stage),
                    &format!("stage {stage} attempt {attempt} failed: {error}; retrying"),
                ))
                .await?;

                tracing::warn!(%task_id, %stage, attempt, delay_ms = delay.as_millis() as u64, "stage retry scheduled");
            }
            RetryDecision::Terminal => {
                match self
                    .repository
                    .update_task_status(
                        &task_id,
                        &[TaskStatus::Pending, TaskStatus::Running],
                        TaskStatus::Failed,
                        Some(error),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(RepositoryError::Conflict(_)) => {
                        tracing::debug!(%task_id, %stage, "terminal failure lost race, discarded");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }

                self.repository
                    .mark_stage_failed(&task_id, stage, error)
                    .await?;

                // Keep the exhausted job inspectable for operators.
                let buried = QueueJob::immediate(task_id, stage, attempt);
                self.queue
                    .enqueue(&dead_letter_for(stage), &buried)
                    .await?;

                self.events.publish(TaskEvent::StageFailed {
                    task_id,
                    stage,
                    attempt,
                    error: error.to_string(),
                    will_retry: false,
                    timestamp: Utc::now(),
                });
                self.events.publish(TaskEvent::TaskStatusChanged {
                    task_id,
                    status: TaskStatus::Failed,
                    timestamp: Utc::now(),
                });
                self.append_message(Message::error(
                    task_id,
                    Some(stage),
                    &format!("stage {stage} failed after {attempt} attempts: {error}"),
                ))
                .await?;

                tracing::error!(%task_id, %stage, attempt, error, "task failed");
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    /// Cancel a pending or running task.
    ///
    /// Cooperative: an in-flight stage handler is allowed to finish, but
    /// its subsequent advancement is rejected by the staleness guard.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let Some(task) = self.repository.get_task(&task_id).await? else {
            return Err(OrchestratorError::TaskNotFound(task_id));
        };
        if task.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }

        match self
            .repository
            .update_task_status(
                &task_id,
                &[TaskStatus::Pending, TaskStatus::Running],
                TaskStatus::Cancelled,
                None,
            )
            .await
        {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                let current = self
                    .repository
                    .get_task(&task_id)
                    .await?
                    .ok_or(OrchestratorError::TaskNotFound(task_id))?;
                return Err(OrchestratorError::InvalidTransition {
                    from: current.status,
                    to: TaskStatus::Cancelled,
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.events.publish(TaskEvent::TaskStatusChanged {
            task_id,
            status: TaskStatus::Cancelled,
            timestamp: Utc::now(),
        });
        self.append_message(Message::new(
            task_id,
            None,
            bookmarch_types::message::MessageKind::Status,
            "task cancelled",
        ))
        .await?;

        tracing::info!(%task_id, "task cancelled");

        self.repository
            .get_task(&task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    /// Permanently delete a task and everything it owns.
    pub async fn purge(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        let Some(task) = self.repository.get_task(&task_id).await? else {
            return Err(OrchestratorError::TaskNotFound(task_id));
        };
        if task.status == TaskStatus::Running {
            return Err(OrchestratorError::PurgeWhileRunning(task_id));
        }
        self.repository.purge_task(&task_id).await?;
        tracing::info!(%task_id, "task purged");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Load the task if it is still live with `stage` as its current stage.
    async fn live_task_at_stage(
        &self,
        task_id: Uuid,
        stage: StageName,
    ) -> Result<Option<Task>, OrchestratorError> {
        let Some(task) = self.repository.get_task(&task_id).await? else {
            tracing::debug!(%task_id, "result for purged task discarded");
            return Ok(None);
        };
        if task.is_terminal() || task.current_stage() != Some(stage) {
            tracing::debug!(
                %task_id,
                %stage,
                status = %task.status,
                index = task.current_stage_index,
                "stale advancement discarded"
            );
            return Ok(None);
        }
        Ok(Some(task))
    }

    /// Append a message and publish the corresponding event.
    async fn append_message(&self, message: Message) -> Result<(), OrchestratorError> {
        self.repository.append_message(&message).await?;
        self.events.publish(TaskEvent::MessageAppended {
            task_id: message.task_id,
            message_id: message.id,
            kind: message.kind,
            content: message.content,
            timestamp: message.timestamp,
        });
        Ok(())
    }
}

/// Merge a stage's context patch into the task context.
///
/// When both are JSON objects the patch's top-level keys overwrite the
/// base's; any other shape replaces the context wholesale.
fn merge_context(base: serde_json::Value, patch: serde_json::Value) -> serde_json::Value {
    match (base, patch) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                base.insert(key, value);
            }
            serde_json::Value::Object(base)
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failing_handler, succeeding_handler, TestHarness};
    use bookmarch_types::message::MessageKind;
    use serde_json::json;

    #[test]
    fn merge_context_overwrites_top_level_keys() {
        let base = json!({"a": 1, "b": {"nested": true}});
        let patch = json!({"b": 2, "c": 3});
        let merged = merge_context(base, patch);
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn merge_context_non_object_patch_replaces() {
        let merged = merge_context(json!({"a": 1}), json!([1, 2, 3]));
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn create_task_persists_and_enqueues_first_stage() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("bookmark_list"));

        let task = h
            .orchestrator
            .create_task(
                "import_only",
                None,
                json!({"source": "chrome_export.html"}),
                "user-1",
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.stages, vec![StageName::Import]);

        let stored = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.current_stage_index, 0);

        let stages = h.repository.list_stages(&task.id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Pending);
        assert!(stages[0].job_ref.is_some());

        assert_eq!(h.queue.depth(&queue_for(StageName::Import)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn create_task_rejects_empty_stage_list() {
        let h = TestHarness::new();
        let err = h
            .orchestrator
            .create_task("custom", Some(vec![]), json!({}), "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn create_task_rejects_unregistered_stage() {
        let h = TestHarness::new();
        // Import registered, validate not
        h.register(StageName::Import, succeeding_handler("x"));

        let err = h
            .orchestrator
            .create_task(
                "custom",
                Some(vec![StageName::Import, StageName::Validate]),
                json!({}),
                "user-1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflow(_)));

        // No task row was created
        assert!(h.repository.list_tasks(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_task_rejects_unknown_workflow_type() {
        let h = TestHarness::new();
        let err = h
            .orchestrator
            .create_task("no_such_preset", None, json!({}), "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn begin_stage_marks_running_and_discards_stale() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));
        let task = h
            .orchestrator
            .create_task("import_only", None, json!({}), "user-1")
            .await
            .unwrap();

        let job = h.claim(StageName::Import).await.unwrap();
        let started = h.orchestrator.begin_stage(&job).await.unwrap().unwrap();
        assert_eq!(started.status, TaskStatus::Running);

        let row = h
            .repository
            .get_stage(&task.id, StageName::Import)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StageStatus::Running);
        assert_eq!(row.attempts, 1);
        assert!(row.started_at.is_some());

        // A job for a stage that is not current is discarded
        let stale = QueueJob::immediate(task.id, StageName::Embed, 1);
        assert!(h.orchestrator.begin_stage(&stale).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn advance_on_success_completes_single_stage_task() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("bookmark_list"));
        let task = h
            .orchestrator
            .create_task("import_only", None, json!({}), "user-1")
            .await
            .unwrap();
        let job = h.claim(StageName::Import).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap().unwrap();

        h.orchestrator
            .advance_on_success(
                task.id,
                StageName::Import,
                12,
                StageOutput::json("bookmark_list", json!({"total": 3})),
            )
            .await
            .unwrap();

        let done = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.current_stage_index, 1);

        let artifacts = h.repository.list_artifacts(&task.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].artifact_type, "bookmark_list");

        let completions: Vec<_> = h
            .repository
            .list_messages(&task.id, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MessageKind::Completion)
            .collect();
        assert_eq!(completions.len(), 2, "stage completion + workflow completion");
    }

    #[tokio::test]
    async fn advance_on_success_applies_context_patch_before_next_stage() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));
        h.register(StageName::Validate, succeeding_handler("y"));
        let task = h
            .orchestrator
            .create_task(
                "custom",
                Some(vec![StageName::Import, StageName::Validate]),
                json!({"source": "export.html"}),
                "user-1",
            )
            .await
            .unwrap();
        let job = h.claim(StageName::Import).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();

        let output = StageOutput::json("bookmark_list", json!({"ids": ["b1"]}))
            .with_context_patch(json!({"bookmark_count": 1}));
        h.orchestrator
            .advance_on_success(task.id, StageName::Import, 5, output)
            .await
            .unwrap();

        let current = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Running);
        assert_eq!(current.current_stage_index, 1);
        assert_eq!(current.context["source"], "export.html");
        assert_eq!(current.context["bookmark_count"], 1);

        // Next stage is enqueued with a fresh pending row
        assert_eq!(
            h.queue.depth(&queue_for(StageName::Validate)).await.unwrap(),
            1
        );
        let row = h
            .repository
            .get_stage(&task.id, StageName::Validate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StageStatus::Pending);
        assert_eq!(row.stage_index, 1);
    }

    #[tokio::test]
    async fn duplicate_success_report_is_discarded() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));
        let task = h
            .orchestrator
            .create_task("import_only", None, json!({}), "user-1")
            .await
            .unwrap();
        let job = h.claim(StageName::Import).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();

        let output = StageOutput::json("x", json!({}));
        h.orchestrator
            .advance_on_success(task.id, StageName::Import, 1, output.clone())
            .await
            .unwrap();
        // Replay: stage already advanced past -- no state change
        h.orchestrator
            .advance_on_success(task.id, StageName::Import, 1, output)
            .await
            .unwrap();

        assert_eq!(h.repository.list_artifacts(&task.id).await.unwrap().len(), 1);
        let done = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(done.current_stage_index, 1);
    }

    #[tokio::test]
    async fn concurrent_advancement_has_exactly_one_winner() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));
        h.register(StageName::Validate, succeeding_handler("y"));
        let task = h
            .orchestrator
            .create_task(
                "custom",
                Some(vec![StageName::Import, StageName::Validate]),
                json!({}),
                "user-1",
            )
            .await
            .unwrap();
        let job = h.claim(StageName::Import).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();

        // Two workers report success for the same stage concurrently
        let (a, b) = tokio::join!(
            h.orchestrator.advance_on_success(
                task.id,
                StageName::Import,
                1,
                StageOutput::json("x", json!({"worker": "a"})),
            ),
            h.orchestrator.advance_on_success(
                task.id,
                StageName::Import,
                1,
                StageOutput::json("x", json!({"worker": "b"})),
            ),
        );
        a.unwrap();
        b.unwrap();

        // Exactly one artifact, exactly one index advancement
        assert_eq!(h.repository.list_artifacts(&task.id).await.unwrap().len(), 1);
        let current = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.current_stage_index, 1);
        assert_eq!(
            h.queue.depth(&queue_for(StageName::Validate)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn failure_below_ceiling_schedules_retry() {
        let h = TestHarness::new();
        h.register(StageName::Validate, failing_handler("connection reset"));
        let task = h
            .orchestrator
            .create_task("custom", Some(vec![StageName::Validate]), json!({}), "u")
            .await
            .unwrap();
        let job = h.claim(StageName::Validate).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();

        h.orchestrator
            .advance_on_failure(task.id, StageName::Validate, 1, "connection reset")
            .await
            .unwrap();
        h.queue.ack(&job.id).await.unwrap();

        let current = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Running, "retrying task stays live");

        let row = h
            .repository
            .get_stage(&task.id, StageName::Validate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StageStatus::Pending);
        assert_eq!(row.last_error.as_deref(), Some("connection reset"));

        // Retry job waits out its backoff before becoming claimable
        assert_eq!(h.queue.depth(&queue_for(StageName::Validate)).await.unwrap(), 1);
        assert!(h.claim(StageName::Validate).await.is_none());
    }

    #[tokio::test]
    async fn failure_at_ceiling_fails_task_and_buries_job() {
        let h = TestHarness::new();
        h.register(StageName::Enrich, failing_handler("model overloaded"));
        let task = h
            .orchestrator
            .create_task("custom", Some(vec![StageName::Enrich]), json!({}), "u")
            .await
            .unwrap();
        let job = h.claim(StageName::Enrich).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();

        // Attempt 3 of max 3
        h.orchestrator
            .advance_on_failure(task.id, StageName::Enrich, 3, "model overloaded")
            .await
            .unwrap();

        let failed = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("model overloaded"));

        let row = h
            .repository
            .get_stage(&task.id, StageName::Enrich)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StageStatus::Failed);

        // No artifact was produced, an error message was appended
        assert!(h.repository.list_artifacts(&task.id).await.unwrap().is_empty());
        let messages = h.repository.list_messages(&task.id, None).await.unwrap();
        assert!(messages.iter().any(|m| m.kind == MessageKind::Error));

        assert_eq!(
            h.queue.depth(&dead_letter_for(StageName::Enrich)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn cancel_discards_late_success() {
        let h = TestHarness::new();
        h.register(StageName::Validate, succeeding_handler("report"));
        let task = h
            .orchestrator
            .create_task("custom", Some(vec![StageName::Validate]), json!({}), "u")
            .await
            .unwrap();
        let job = h.claim(StageName::Validate).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();

        let cancelled = h.orchestrator.cancel(task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        // The in-flight worker reports success afterwards; it must be a no-op
        h.orchestrator
            .advance_on_success(
                task.id,
                StageName::Validate,
                1,
                StageOutput::json("report", json!({})),
            )
            .await
            .unwrap();

        let still = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(still.status, TaskStatus::Cancelled);
        assert_eq!(still.current_stage_index, 0);
        assert!(h.repository.list_artifacts(&task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_terminal_task_rejected() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));
        let task = h
            .orchestrator
            .create_task("import_only", None, json!({}), "u")
            .await
            .unwrap();
        let job = h.claim(StageName::Import).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();
        h.orchestrator
            .advance_on_success(task.id, StageName::Import, 1, StageOutput::json("x", json!({})))
            .await
            .unwrap();

        let err = h.orchestrator.cancel(task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn purge_refused_while_running_then_cascades() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));
        let task = h
            .orchestrator
            .create_task("import_only", None, json!({}), "u")
            .await
            .unwrap();
        let job = h.claim(StageName::Import).await.unwrap();
        h.orchestrator.begin_stage(&job).await.unwrap();

        let err = h.orchestrator.purge(task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PurgeWhileRunning(_)));

        h.orchestrator.cancel(task.id).await.unwrap();
        h.orchestrator.purge(task.id).await.unwrap();

        assert!(h.repository.get_task(&task.id).await.unwrap().is_none());
        assert!(h.repository.list_stages(&task.id).await.unwrap().is_empty());
        assert!(h.repository.list_messages(&task.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scenario_three_stage_pipeline_completes() {
        // Scenario: [import, validate, enrich], all succeed
        let h = TestHarness::new();
        for stage in [StageName::Import, StageName::Validate, StageName::Enrich] {
            h.register(stage, succeeding_handler("report"));
        }
        let task = h
            .orchestrator
            .create_task(
                "custom",
                Some(vec![StageName::Import, StageName::Validate, StageName::Enrich]),
                json!({}),
                "u",
            )
            .await
            .unwrap();

        for stage in [StageName::Import, StageName::Validate, StageName::Enrich] {
            let job = h.claim(stage).await.unwrap();
            h.orchestrator.begin_stage(&job).await.unwrap().unwrap();
            h.orchestrator
                .advance_on_success(task.id, stage, 1, StageOutput::json("report", json!({})))
                .await
                .unwrap();
        }

        let done = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.current_stage_index, 3);
        assert_eq!(done.progress_percent(), 100);
        assert_eq!(h.repository.list_artifacts(&task.id).await.unwrap().len(), 3);

        let completions = h
            .repository
            .list_messages(&task.id, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MessageKind::Completion)
            .count();
        assert!(completions >= 3);
    }

    #[tokio::test]
    async fn scenario_fail_twice_then_succeed_proceeds() {
        // Scenario: validate fails twice then succeeds (max_attempts = 3)
        let h = TestHarness::new();
        h.register(StageName::Validate, succeeding_handler("report"));
        h.register(StageName::Enrich, succeeding_handler("report"));
        let task = h
            .orchestrator
            .create_task(
                "custom",
                Some(vec![StageName::Validate, StageName::Enrich]),
                json!({}),
                "u",
            )
            .await
            .unwrap();

        // Attempts 1 and 2 fail
        for attempt in 1..=2 {
            h.queue.make_all_available().await;
            let job = h.claim(StageName::Validate).await.unwrap();
            assert_eq!(job.attempt, attempt);
            h.orchestrator.begin_stage(&job).await.unwrap().unwrap();
            h.orchestrator
                .advance_on_failure(task.id, StageName::Validate, attempt, "503")
                .await
                .unwrap();
        }

        // Attempt 3 succeeds
        h.queue.make_all_available().await;
        let job = h.claim(StageName::Validate).await.unwrap();
        assert_eq!(job.attempt, 3);
        h.orchestrator.begin_stage(&job).await.unwrap().unwrap();
        h.orchestrator
            .advance_on_success(task.id, StageName::Validate, 1, StageOutput::json("report", json!({})))
            .await
            .unwrap();

        let row = h
            .repository
            .get_stage(&task.id, StageName::Validate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.attempts, 3);
        assert_eq!(row.status, StageStatus::Completed);

        // Task proceeded to enrich
        let current = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.current_stage_index, 1);
        assert_eq!(current.status, TaskStatus::Running);
        assert_eq!(h.queue.depth(&queue_for(StageName::Enrich)).await.unwrap(), 1);
    }
}
