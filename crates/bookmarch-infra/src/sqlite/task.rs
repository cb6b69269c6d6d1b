//! SQLite task-family repository implementation.
//!
//! Implements `TaskRepository` from `bookmarch-core` using sqlx with split
//! read/write pools. Stage lists, contexts, and payloads are stored as JSON
//! text. The advancement writes are conditional UPDATEs -- the WHERE clause
//! carries the expected status (and stage index), so a lost race surfaces
//! as zero affected rows and is reported as `Conflict`.

use bookmarch_core::repository::task::TaskRepository;
use bookmarch_types::artifact::Artifact;
use bookmarch_types::error::RepositoryError;
use bookmarch_types::message::{Message, MessageKind};
use bookmarch_types::stage::{StageName, StageProgress, StageStatus};
use bookmarch_types::task::{Task, TaskStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::checksum::sha256_hex;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `TaskRepository`.
pub struct SqliteTaskRepository {
    pool: DatabasePool,
}

impl SqliteTaskRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Resolve a zero-row conditional update to NotFound or Conflict.
    async fn conditional_failure(
        &self,
        id: &Uuid,
        detail: &str,
    ) -> Result<(), RepositoryError> {
        let exists = sqlx::query("SELECT id FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match exists {
            Some(_) => Err(RepositoryError::Conflict(detail.to_string())),
            None => Err(RepositoryError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Microsecond-precision RFC3339. All timestamps share this format, so the
/// TEXT columns compare lexicographically in chronological order (the
/// messages `since` query depends on this).
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_task_status(s: &str) -> Result<TaskStatus, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid task status: {s}")))
}

fn parse_stage_status(s: &str) -> Result<StageStatus, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid stage status: {s}")))
}

fn parse_stage_name(s: &str) -> Result<StageName, RepositoryError> {
    s.parse::<StageName>()
        .map_err(|e| RepositoryError::Query(e.to_string()))
}

fn parse_json(s: &str, what: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct TaskRow {
    id: String,
    workflow_type: String,
    stages: String,
    current_stage_index: i64,
    status: String,
    context: String,
    owner: String,
    metadata: String,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_type: row.try_get("workflow_type")?,
            stages: row.try_get("stages")?,
            current_stage_index: row.try_get("current_stage_index")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            owner: row.try_get("owner")?,
            metadata: row.try_get("metadata")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        let stages: Vec<StageName> = serde_json::from_str(&self.stages)
            .map_err(|e| RepositoryError::Query(format!("invalid stage list: {e}")))?;

        Ok(Task {
            id: parse_uuid(&self.id)?,
            workflow_type: self.workflow_type,
            stages,
            current_stage_index: self.current_stage_index as usize,
            status: parse_task_status(&self.status)?,
            context: parse_json(&self.context, "context")?,
            owner: self.owner,
            metadata: parse_json(&self.metadata, "metadata")?,
            error_message: self.error_message,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StageRow {
    task_id: String,
    stage: String,
    stage_index: i64,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    job_ref: Option<String>,
    progress_data: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl StageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_id: row.try_get("task_id")?,
            stage: row.try_get("stage")?,
            stage_index: row.try_get("stage_index")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            job_ref: row.try_get("job_ref")?,
            progress_data: row.try_get("progress_data")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_progress(self) -> Result<StageProgress, RepositoryError> {
        Ok(StageProgress {
            task_id: parse_uuid(&self.task_id)?,
            stage: parse_stage_name(&self.stage)?,
            stage_index: self.stage_index as usize,
            status: parse_stage_status(&self.status)?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            job_ref: self.job_ref,
            progress_data: parse_json(&self.progress_data, "progress_data")?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct ArtifactRow {
    id: String,
    task_id: String,
    producing_stage: String,
    artifact_type: String,
    content_type: String,
    payload: String,
    checksum: Option<String>,
    size_bytes: Option<i64>,
    created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            producing_stage: row.try_get("producing_stage")?,
            artifact_type: row.try_get("artifact_type")?,
            content_type: row.try_get("content_type")?,
            payload: row.try_get("payload")?,
            checksum: row.try_get("checksum")?,
            size_bytes: row.try_get("size_bytes")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_artifact(self) -> Result<Artifact, RepositoryError> {
        Ok(Artifact {
            id: parse_uuid(&self.id)?,
            task_id: parse_uuid(&self.task_id)?,
            producing_stage: parse_stage_name(&self.producing_stage)?,
            artifact_type: self.artifact_type,
            content_type: self.content_type,
            payload: parse_json(&self.payload, "payload")?,
            checksum: self.checksum,
            size_bytes: self.size_bytes,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    task_id: String,
    stage: Option<String>,
    kind: String,
    content: String,
    timestamp: String,
    metadata: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            stage: row.try_get("stage")?,
            kind: row.try_get("kind")?,
            content: row.try_get("content")?,
            timestamp: row.try_get("timestamp")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn into_message(self) -> Result<Message, RepositoryError> {
        let kind: MessageKind =
            serde_json::from_value(serde_json::Value::String(self.kind.clone()))
                .map_err(|_| RepositoryError::Query(format!("invalid message kind: {}", self.kind)))?;

        Ok(Message {
            id: parse_uuid(&self.id)?,
            task_id: parse_uuid(&self.task_id)?,
            stage: self.stage.as_deref().map(parse_stage_name).transpose()?,
            kind,
            content: self.content,
            timestamp: parse_datetime(&self.timestamp)?,
            metadata: parse_json(&self.metadata, "metadata")?,
        })
    }
}

// ---------------------------------------------------------------------------
// TaskRepository impl
// ---------------------------------------------------------------------------

impl TaskRepository for SqliteTaskRepository {
    async fn create_task(
        &self,
        task: &Task,
        first_stage: &StageProgress,
    ) -> Result<(), RepositoryError> {
        let stages_json = serde_json::to_string(&task.stages)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let context_json = serde_json::to_string(&task.context)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let metadata_json = serde_json::to_string(&task.metadata)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let progress_json = serde_json::to_string(&first_stage.progress_data)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO tasks
               (id, workflow_type, stages, current_stage_index, status, context,
                owner, metadata, error_message, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.workflow_type)
        .bind(&stages_json)
        .bind(task.current_stage_index as i64)
        .bind(task.status.to_string())
        .bind(&context_json)
        .bind(&task.owner)
        .bind(&metadata_json)
        .bind(&task.error_message)
        .bind(format_datetime(&task.created_at))
        .bind(format_datetime(&task.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO task_stages
               (task_id, stage, stage_index, status, attempts, last_error,
                job_ref, progress_data, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(first_stage.task_id.to_string())
        .bind(first_stage.stage.as_str())
        .bind(first_stage.stage_index as i64)
        .bind(first_stage.status.to_string())
        .bind(first_stage.attempts as i64)
        .bind(&first_stage.last_error)
        .bind(&first_stage.job_ref)
        .bind(&progress_json)
        .bind(first_stage.started_at.as_ref().map(format_datetime))
        .bind(first_stage.completed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TaskRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }

    async fn count_tasks_with_status(&self, status: TaskStatus) -> Result<u64, RepositoryError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(status.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(count.0 as u64)
    }

    async fn update_task_status(
        &self,
        id: &Uuid,
        expected: &[TaskStatus],
        next: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let placeholders = vec!["?"; expected.len().max(1)].join(", ");
        let sql = format!(
            "UPDATE tasks SET status = ?, error_message = COALESCE(?, error_message), updated_at = ? \
             WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(next.to_string())
            .bind(error)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string());
        for status in expected {
            query = query.bind(status.to_string());
        }

        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return self
                .conditional_failure(id, &format!("status update to {next} lost the race"))
                .await;
        }
        Ok(())
    }

    async fn advance_task(
        &self,
        id: &Uuid,
        from_index: usize,
        status: TaskStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE tasks
               SET current_stage_index = ?, status = ?, updated_at = ?
               WHERE id = ? AND current_stage_index = ?
                 AND status IN ('pending', 'running')"#,
        )
        .bind((from_index + 1) as i64)
        .bind(status.to_string())
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(from_index as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return self
                .conditional_failure(id, &format!("advancement from index {from_index} lost the race"))
                .await;
        }
        Ok(())
    }

    async fn update_task_context(
        &self,
        id: &Uuid,
        context: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        let context_json =
            serde_json::to_string(context).map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query("UPDATE tasks SET context = ?, updated_at = ? WHERE id = ?")
            .bind(&context_json)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn purge_task(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        // Children (task_stages, artifacts, messages, jobs) cascade via FK.
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_stage(&self, row: &StageProgress) -> Result<(), RepositoryError> {
        let progress_json = serde_json::to_string(&row.progress_data)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO task_stages
               (task_id, stage, stage_index, status, attempts, last_error,
                job_ref, progress_data, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(task_id, stage) DO UPDATE SET
                 stage_index = excluded.stage_index,
                 status = excluded.status,
                 last_error = excluded.last_error,
                 job_ref = excluded.job_ref,
                 progress_data = excluded.progress_data"#,
        )
        .bind(row.task_id.to_string())
        .bind(row.stage.as_str())
        .bind(row.stage_index as i64)
        .bind(row.status.to_string())
        .bind(row.attempts as i64)
        .bind(&row.last_error)
        .bind(&row.job_ref)
        .bind(&progress_json)
        .bind(row.started_at.as_ref().map(format_datetime))
        .bind(row.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_stage(
        &self,
        task_id: &Uuid,
        stage: StageName,
    ) -> Result<Option<StageProgress>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM task_stages WHERE task_id = ? AND stage = ?")
            .bind(task_id.to_string())
            .bind(stage.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = StageRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_progress()?))
            }
            None => Ok(None),
        }
    }

    async fn list_stages(&self, task_id: &Uuid) -> Result<Vec<StageProgress>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM task_stages WHERE task_id = ? ORDER BY stage_index ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut stages = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StageRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            stages.push(r.into_progress()?);
        }
        Ok(stages)
    }

    async fn mark_stage_running(
        &self,
        task_id: &Uuid,
        stage: StageName,
        attempt: u32,
        job_ref: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE task_stages
               SET status = 'running', attempts = ?, job_ref = ?,
                   started_at = COALESCE(started_at, ?)
               WHERE task_id = ? AND stage = ?"#,
        )
        .bind(attempt as i64)
        .bind(job_ref)
        .bind(format_datetime(&Utc::now()))
        .bind(task_id.to_string())
        .bind(stage.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_stage_completed(
        &self,
        task_id: &Uuid,
        stage: StageName,
        progress_data: Option<&serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        let progress_json = progress_data
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE task_stages
               SET status = 'completed', completed_at = ?,
                   progress_data = COALESCE(?, progress_data)
               WHERE task_id = ? AND stage = ?"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(&progress_json)
        .bind(task_id.to_string())
        .bind(stage.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_stage_failed(
        &self,
        task_id: &Uuid,
        stage: StageName,
        error: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE task_stages
               SET status = 'failed', last_error = ?, completed_at = ?
               WHERE task_id = ? AND stage = ?"#,
        )
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(task_id.to_string())
        .bind(stage.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_stage_retrying(
        &self,
        task_id: &Uuid,
        stage: StageName,
        error: &str,
        job_ref: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE task_stages
               SET status = 'pending', last_error = ?, job_ref = ?
               WHERE task_id = ? AND stage = ?"#,
        )
        .bind(error)
        .bind(job_ref)
        .bind(task_id.to_string())
        .bind(stage.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn count_running_stages(&self, stage: StageName) -> Result<u64, RepositoryError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM task_stages WHERE stage = ? AND status = 'running'",
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(count.0 as u64)
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), RepositoryError> {
        let payload_json = serde_json::to_string(&artifact.payload)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let checksum = sha256_hex(&payload_json);
        let size_bytes = payload_json.len() as i64;

        sqlx::query(
            r#"INSERT INTO artifacts
               (id, task_id, producing_stage, artifact_type, content_type,
                payload, checksum, size_bytes, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(artifact.id.to_string())
        .bind(artifact.task_id.to_string())
        .bind(artifact.producing_stage.as_str())
        .bind(&artifact.artifact_type)
        .bind(&artifact.content_type)
        .bind(&payload_json)
        .bind(&checksum)
        .bind(size_bytes)
        .bind(format_datetime(&artifact.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict("artifact already exists".to_string())
            }
            _ => RepositoryError::Query(e.to_string()),
        })?;

        Ok(())
    }

    async fn list_artifacts(&self, task_id: &Uuid) -> Result<Vec<Artifact>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM artifacts WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut artifacts = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ArtifactRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            artifacts.push(r.into_artifact()?);
        }
        Ok(artifacts)
    }

    async fn append_message(&self, message: &Message) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&message.metadata)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO messages (id, task_id, stage, kind, content, timestamp, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(message.id.to_string())
        .bind(message.task_id.to_string())
        .bind(message.stage.map(|s| s.as_str()))
        .bind(message.kind.to_string())
        .bind(&message.content)
        .bind(format_datetime(&message.timestamp))
        .bind(&metadata_json)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_messages(
        &self,
        task_id: &Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = match since {
            Some(since) => {
                sqlx::query(
                    r#"SELECT * FROM messages
                       WHERE task_id = ? AND timestamp > ?
                       ORDER BY timestamp ASC, id ASC"#,
                )
                .bind(task_id.to_string())
                .bind(format_datetime(&since))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM messages WHERE task_id = ? ORDER BY timestamp ASC, id ASC",
                )
                .bind(task_id.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = MessageRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            messages.push(r.into_message()?);
        }
        Ok(messages)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
