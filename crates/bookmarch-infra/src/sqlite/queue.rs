//! SQLite-backed durable job queue.
//!
//! Named queues live in one `jobs` table. A claim is a single conditional
//! UPDATE on the writer pool (one writer connection, so claims are
//! serialized and each job goes to exactly one consumer at a time). Claimed
//! jobs carry a lease: if the consumer dies without acknowledging, the
//! claim expires and the job becomes claimable again -- at-least-once
//! delivery, with duplicates handled by the orchestrator's staleness guard.
//! Backoff is a future `available_at`; dead-letter queues are ordinary
//! queues under a `:dead` suffix.

use std::time::Duration;

use bookmarch_core::queue::JobQueue;
use bookmarch_types::error::QueueError;
use bookmarch_types::job::QueueJob;
use bookmarch_types::stage::StageName;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// Default claim lease before a job is considered abandoned.
const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// SQLite-backed implementation of `JobQueue`.
pub struct SqliteJobQueue {
    pool: DatabasePool,
    lease: Duration,
}

impl SqliteJobQueue {
    /// Create a new queue with the default claim lease (5 minutes).
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
        }
    }

    /// Override the claim lease (shorter leases redeliver abandoned jobs
    /// sooner, at the cost of more duplicate deliveries).
    pub fn with_lease(pool: DatabasePool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::MalformedJob(format!("invalid datetime: {e}")))
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueueJob, QueueError> {
    let id: String = row
        .try_get("id")
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    let task_id: String = row
        .try_get("task_id")
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    let stage: String = row
        .try_get("stage")
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    let attempt: i64 = row
        .try_get("attempt")
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    let payload: String = row
        .try_get("payload")
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    let enqueued_at: String = row
        .try_get("enqueued_at")
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    let available_at: String = row
        .try_get("available_at")
        .map_err(|e| QueueError::Backend(e.to_string()))?;

    Ok(QueueJob {
        id: id
            .parse::<Uuid>()
            .map_err(|e| QueueError::MalformedJob(format!("invalid job id: {e}")))?,
        task_id: task_id
            .parse::<Uuid>()
            .map_err(|e| QueueError::MalformedJob(format!("invalid task id: {e}")))?,
        stage: stage
            .parse::<StageName>()
            .map_err(|e| QueueError::MalformedJob(e.to_string()))?,
        attempt: attempt as u32,
        payload: serde_json::from_str(&payload)
            .map_err(|e| QueueError::MalformedJob(format!("invalid payload JSON: {e}")))?,
        enqueued_at: parse_datetime(&enqueued_at)?,
        available_at: parse_datetime(&available_at)?,
    })
}

impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, queue: &str, job: &QueueJob) -> Result<(), QueueError> {
        let payload_json = serde_json::to_string(&job.payload)
            .map_err(|e| QueueError::MalformedJob(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO jobs
               (id, queue, task_id, stage, attempt, payload, enqueued_at, available_at, claimed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)"#,
        )
        .bind(job.id.to_string())
        .bind(queue)
        .bind(job.task_id.to_string())
        .bind(job.stage.as_str())
        .bind(job.attempt as i64)
        .bind(&payload_json)
        .bind(format_datetime(&job.enqueued_at))
        .bind(format_datetime(&job.available_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        tracing::debug!(job_id = %job.id, queue, attempt = job.attempt, "job enqueued");
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<QueueJob>, QueueError> {
        let now = Utc::now();
        let lease_cutoff = now
            - chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero());

        let row = sqlx::query(
            r#"UPDATE jobs SET claimed_at = ?
               WHERE id = (
                   SELECT id FROM jobs
                   WHERE queue = ? AND available_at <= ?
                     AND (claimed_at IS NULL OR claimed_at <= ?)
                   ORDER BY available_at ASC, id ASC
                   LIMIT 1
               )
               RETURNING *"#,
        )
        .bind(format_datetime(&now))
        .bind(queue)
        .bind(format_datetime(&now))
        .bind(format_datetime(&lease_cutoff))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn ack(&self, job_id: &Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(count.0 as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::task::SqliteTaskRepository;
    use bookmarch_core::repository::task::TaskRepository;
    use bookmarch_types::job::queue_for;
    use bookmarch_types::stage::StageProgress;
    use bookmarch_types::task::Task;
    use serde_json::json;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    /// Jobs reference their task by foreign key, so tests need a real task.
    async fn seed_task(pool: &DatabasePool) -> Uuid {
        let repo = SqliteTaskRepository::new(pool.clone());
        let task = Task::new("import_only", vec![StageName::Import], json!({}), "user-1");
        let progress = StageProgress::pending(task.id, StageName::Import, 0);
        repo.create_task(&task, &progress).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_enqueue_claim_ack_roundtrip() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        let task_id = seed_task(&pool).await;
        let name = queue_for(StageName::Import);

        let job = QueueJob::immediate(task_id, StageName::Import, 1)
            .with_payload(json!({"hint": "first"}));
        queue.enqueue(&name, &job).await.unwrap();
        assert_eq!(queue.depth(&name).await.unwrap(), 1);

        let claimed = queue.claim(&name).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.payload["hint"], "first");

        // Claimed job is invisible to further claims within the lease
        assert!(queue.claim(&name).await.unwrap().is_none());

        queue.ack(&job.id).await.unwrap();
        assert_eq!(queue.depth(&name).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable_until_available() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        let task_id = seed_task(&pool).await;
        let name = queue_for(StageName::Import);

        let job = QueueJob::delayed(task_id, StageName::Import, 2, Duration::from_secs(3600));
        queue.enqueue(&name, &job).await.unwrap();

        assert!(queue.claim(&name).await.unwrap().is_none());
        assert_eq!(queue.depth(&name).await.unwrap(), 1, "delayed job still counted");
    }

    #[tokio::test]
    async fn test_claims_oldest_available_first() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        let task_id = seed_task(&pool).await;
        let name = queue_for(StageName::Import);

        let mut first = QueueJob::immediate(task_id, StageName::Import, 1);
        first.available_at = Utc::now() - chrono::Duration::seconds(20);
        let mut second = QueueJob::immediate(task_id, StageName::Import, 1);
        second.available_at = Utc::now() - chrono::Duration::seconds(10);

        // Enqueue newest first to prove ordering is by availability
        queue.enqueue(&name, &second).await.unwrap();
        queue.enqueue(&name, &first).await.unwrap();

        assert_eq!(queue.claim(&name).await.unwrap().unwrap().id, first.id);
        assert_eq!(queue.claim(&name).await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::with_lease(pool.clone(), Duration::ZERO);
        let task_id = seed_task(&pool).await;
        let name = queue_for(StageName::Import);

        let job = QueueJob::immediate(task_id, StageName::Import, 1);
        queue.enqueue(&name, &job).await.unwrap();

        let first = queue.claim(&name).await.unwrap().unwrap();
        // Lease of zero: the claim expires immediately, so the job is
        // redelivered (at-least-once)
        let second = queue.claim(&name).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_queues_are_isolated_by_name() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        let task_id = seed_task(&pool).await;

        let job = QueueJob::immediate(task_id, StageName::Import, 1);
        queue.enqueue(&queue_for(StageName::Import), &job).await.unwrap();

        assert!(queue
            .claim(&queue_for(StageName::Validate))
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.depth(&queue_for(StageName::Validate)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purging_task_cascades_to_jobs() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        let task_id = seed_task(&pool).await;
        let name = queue_for(StageName::Import);

        let job = QueueJob::immediate(task_id, StageName::Import, 1);
        queue.enqueue(&name, &job).await.unwrap();
        assert_eq!(queue.depth(&name).await.unwrap(), 1);

        let repo = SqliteTaskRepository::new(pool.clone());
        repo.purge_task(&task_id).await.unwrap();

        assert_eq!(queue.depth(&name).await.unwrap(), 0, "jobs cascade with the task");
    }
}
