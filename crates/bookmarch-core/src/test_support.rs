//! In-memory repository and queue doubles for engine tests.
//!
//! These mirror the conditional-write semantics of the SQLite
//! implementations (a failed condition is `RepositoryError::Conflict`), so
//! the orchestrator's race behavior can be exercised without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bookmarch_types::artifact::Artifact;
use bookmarch_types::error::{QueueError, RepositoryError, StageError};
use bookmarch_types::job::{queue_for, QueueJob};
use bookmarch_types::message::Message;
use bookmarch_types::stage::{StageCapability, StageName, StagePolicy, StageProgress, StageStatus};
use bookmarch_types::task::{Task, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::event::TaskEventBus;
use crate::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use crate::repository::capability::CapabilityRepository;
use crate::repository::task::TaskRepository;
use crate::stage::handler::{StageHandler, StageInput, StageOutput};
use crate::stage::registry::StageRegistry;

// ---------------------------------------------------------------------------
// Memory task repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: Mutex<HashMap<Uuid, Task>>,
    stages: Mutex<HashMap<(Uuid, StageName), StageProgress>>,
    artifacts: Mutex<Vec<Artifact>>,
    messages: Mutex<Vec<Message>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRepository for MemoryTaskRepository {
    async fn create_task(
        &self,
        task: &Task,
        first_stage: &StageProgress,
    ) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.id) {
            return Err(RepositoryError::Conflict("task exists".into()));
        }
        tasks.insert(task.id, task.clone());
        self.stages
            .lock()
            .unwrap()
            .insert((task.id, first_stage.stage), first_stage.clone());
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    async fn list_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks: Vec<Task> = self.tasks.lock().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_tasks_with_status(&self, status: TaskStatus) -> Result<u64, RepositoryError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == status)
            .count() as u64)
    }

    async fn update_task_status(
        &self,
        id: &Uuid,
        expected: &[TaskStatus],
        next: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !expected.contains(&task.status) {
            return Err(RepositoryError::Conflict(format!(
                "status is {}, expected one of {:?}",
                task.status, expected
            )));
        }
        task.status = next;
        if let Some(error) = error {
            task.error_message = Some(error.to_string());
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn advance_task(
        &self,
        id: &Uuid,
        from_index: usize,
        status: TaskStatus,
    ) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let live = matches!(task.status, TaskStatus::Pending | TaskStatus::Running);
        if !live || task.current_stage_index != from_index {
            return Err(RepositoryError::Conflict(format!(
                "index is {} (status {}), expected {}",
                task.current_stage_index, task.status, from_index
            )));
        }
        task.current_stage_index = from_index + 1;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_context(
        &self,
        id: &Uuid,
        context: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(id).ok_or(RepositoryError::NotFound)?;
        task.context = context.clone();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn purge_task(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let existed = self.tasks.lock().unwrap().remove(id).is_some();
        self.stages.lock().unwrap().retain(|(t, _), _| t != id);
        self.artifacts.lock().unwrap().retain(|a| a.task_id != *id);
        self.messages.lock().unwrap().retain(|m| m.task_id != *id);
        Ok(existed)
    }

    async fn upsert_stage(&self, row: &StageProgress) -> Result<(), RepositoryError> {
        self.stages
            .lock()
            .unwrap()
            .insert((row.task_id, row.stage), row.clone());
        Ok(())
    }

    async fn get_stage(
        &self,
        task_id: &Uuid,
        stage: StageName,
    ) -> Result<Option<StageProgress>, RepositoryError> {
        Ok(self.stages.lock().unwrap().get(&(*task_id, stage)).cloned())
    }

    async fn list_stages(&self, task_id: &Uuid) -> Result<Vec<StageProgress>, RepositoryError> {
        let mut rows: Vec<StageProgress> = self
            .stages
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.task_id == *task_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.stage_index);
        Ok(rows)
    }

    async fn mark_stage_running(
        &self,
        task_id: &Uuid,
        stage: StageName,
        attempt: u32,
        job_ref: &str,
    ) -> Result<(), RepositoryError> {
        let mut stages = self.stages.lock().unwrap();
        let row = stages
            .get_mut(&(*task_id, stage))
            .ok_or(RepositoryError::NotFound)?;
        row.status = StageStatus::Running;
        row.attempts = attempt;
        row.job_ref = Some(job_ref.to_string());
        if row.started_at.is_none() {
            row.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_stage_completed(
        &self,
        task_id: &Uuid,
        stage: StageName,
        progress_data: Option<&serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        let mut stages = self.stages.lock().unwrap();
        let row = stages
            .get_mut(&(*task_id, stage))
            .ok_or(RepositoryError::NotFound)?;
        row.status = StageStatus::Completed;
        row.completed_at = Some(Utc::now());
        if let Some(data) = progress_data {
            row.progress_data = data.clone();
        }
        Ok(())
    }

    async fn mark_stage_failed(
        &self,
        task_id: &Uuid,
        stage: StageName,
        error: &str,
    ) -> Result<(), RepositoryError> {
        let mut stages = self.stages.lock().unwrap();
        let row = stages
            .get_mut(&(*task_id, stage))
            .ok_or(RepositoryError::NotFound)?;
        row.status = StageStatus::Failed;
        row.last_error = Some(error.to_string());
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_stage_retrying(
        &self,
        task_id: &Uuid,
        stage: StageName,
        error: &str,
        job_ref: &str,
    ) -> Result<(), RepositoryError> {
        let mut stages = self.stages.lock().unwrap();
        let row = stages
            .get_mut(&(*task_id, stage))
            .ok_or(RepositoryError::NotFound)?;
        row.status = StageStatus::Pending;
        row.last_error = Some(error.to_string());
        row.job_ref = Some(job_ref.to_string());
        Ok(())
    }

    async fn count_running_stages(&self, stage: StageName) -> Result<u64, RepositoryError> {
        Ok(self
            .stages
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.stage == stage && r.status == StageStatus::Running)
            .count() as u64)
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), RepositoryError> {
        let mut artifacts = self.artifacts.lock().unwrap();
        if artifacts.iter().any(|a| a.id == artifact.id) {
            return Err(RepositoryError::Conflict("artifact exists".into()));
        }
        artifacts.push(artifact.clone());
        Ok(())
    }

    async fn list_artifacts(&self, task_id: &Uuid) -> Result<Vec<Artifact>, RepositoryError> {
        let mut artifacts: Vec<Artifact> = self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.task_id == *task_id)
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    async fn append_message(&self, message: &Message) -> Result<(), RepositoryError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        task_id: &Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.task_id == *task_id)
            .filter(|m| since.is_none_or(|since| m.timestamp > since))
            .cloned()
            .collect();
        messages.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
        Ok(messages)
    }
}

// ---------------------------------------------------------------------------
// Memory capability repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCapabilityRepository {
    rows: Mutex<HashMap<StageName, StageCapability>>,
}

impl MemoryCapabilityRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CapabilityRepository for MemoryCapabilityRepository {
    async fn upsert_capability(&self, capability: &StageCapability) -> Result<(), RepositoryError> {
        self.rows
            .lock()
            .unwrap()
            .insert(capability.stage, capability.clone());
        Ok(())
    }

    async fn get_capability(
        &self,
        stage: StageName,
    ) -> Result<Option<StageCapability>, RepositoryError> {
        Ok(self.rows.lock().unwrap().get(&stage).cloned())
    }

    async fn list_capabilities(&self) -> Result<Vec<StageCapability>, RepositoryError> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn touch_heartbeat(
        &self,
        stage: StageName,
        healthy: bool,
    ) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&stage).ok_or(RepositoryError::NotFound)?;
        row.healthy = healthy;
        row.last_heartbeat = Some(Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memory job queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryJobQueue {
    queues: Mutex<HashMap<String, Vec<(QueueJob, bool)>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse all backoff delays so delayed jobs become claimable now.
    pub async fn make_all_available(&self) {
        let past = Utc::now() - Duration::seconds(1);
        for jobs in self.queues.lock().unwrap().values_mut() {
            for (job, _) in jobs.iter_mut() {
                job.available_at = past;
            }
        }
    }
}

impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, queue: &str, job: &QueueJob) -> Result<(), QueueError> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push((job.clone(), false));
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<QueueJob>, QueueError> {
        let now = Utc::now();
        let mut queues = self.queues.lock().unwrap();
        let Some(jobs) = queues.get_mut(queue) else {
            return Ok(None);
        };
        for (job, claimed) in jobs.iter_mut() {
            if !*claimed && job.available_at <= now {
                *claimed = true;
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn ack(&self, job_id: &Uuid) -> Result<(), QueueError> {
        for jobs in self.queues.lock().unwrap().values_mut() {
            jobs.retain(|(job, _)| job.id != *job_id);
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|jobs| jobs.len() as u64)
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct SucceedingHandler {
    artifact_type: String,
}

impl StageHandler for SucceedingHandler {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        Ok(StageOutput::json(
            &self.artifact_type,
            serde_json::json!({"stage": input.stage.as_str(), "attempt": input.attempt}),
        ))
    }
}

/// A handler that always succeeds with the given artifact type.
pub fn succeeding_handler(artifact_type: &str) -> SucceedingHandler {
    SucceedingHandler {
        artifact_type: artifact_type.to_string(),
    }
}

pub struct FailingHandler {
    error: String,
}

impl StageHandler for FailingHandler {
    async fn execute(&self, _input: StageInput) -> Result<StageOutput, StageError> {
        Err(StageError::Handler(self.error.clone()))
    }
}

/// A handler that always fails with the given error.
pub fn failing_handler(error: &str) -> FailingHandler {
    FailingHandler {
        error: error.to_string(),
    }
}

/// A handler that fails a fixed number of times, then succeeds.
pub struct FlakyHandler {
    failures_before_success: u32,
    calls: Mutex<u32>,
}

impl FlakyHandler {
    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: Mutex::new(0),
        }
    }
}

impl StageHandler for FlakyHandler {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if call <= self.failures_before_success {
            Err(StageError::Unavailable(format!("flaky failure {call}")))
        } else {
            Ok(StageOutput::json(
                "report",
                serde_json::json!({"stage": input.stage.as_str()}),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Everything an engine test needs, wired to memory implementations.
pub struct TestHarness {
    pub repository: Arc<MemoryTaskRepository>,
    pub queue: Arc<MemoryJobQueue>,
    pub registry: Arc<StageRegistry>,
    pub events: TaskEventBus,
    pub orchestrator: Arc<Orchestrator<MemoryTaskRepository, MemoryJobQueue>>,
}

impl TestHarness {
    pub fn new() -> Self {
        let repository = Arc::new(MemoryTaskRepository::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let registry = Arc::new(StageRegistry::new());
        let events = TaskEventBus::new(256);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&repository),
            Arc::clone(&queue),
            Arc::clone(&registry),
            events.clone(),
        ));
        Self {
            repository,
            queue,
            registry,
            events,
            orchestrator,
        }
    }

    /// Register a handler with a default capability row.
    pub fn register<H: StageHandler + 'static>(&self, stage: StageName, handler: H) {
        self.registry
            .register(StageCapability::new(stage, StagePolicy::default()), handler);
    }

    /// Claim the next available job from a stage's queue.
    pub async fn claim(&self, stage: StageName) -> Option<QueueJob> {
        self.queue.claim(&queue_for(stage)).await.unwrap()
    }
}
