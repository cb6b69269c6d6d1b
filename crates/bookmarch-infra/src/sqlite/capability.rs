//! SQLite stage capability registry implementation.
//!
//! Capability rows are keyed by stage name; the policy is stored as a JSON
//! blob. Rows are written at startup from configuration, replaced on
//! operator hot-reload, and heartbeat-touched by the health monitor.

use bookmarch_core::repository::capability::CapabilityRepository;
use bookmarch_types::error::RepositoryError;
use bookmarch_types::stage::{StageCapability, StageName, StagePolicy};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CapabilityRepository`.
pub struct SqliteCapabilityRepository {
    pool: DatabasePool,
}

impl SqliteCapabilityRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn capability_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StageCapability, RepositoryError> {
    let stage: String = row
        .try_get("stage")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let stage: StageName = stage
        .parse()
        .map_err(|e: bookmarch_types::stage::UnknownStage| RepositoryError::Query(e.to_string()))?;

    let policy: String = row
        .try_get("policy")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let policy: StagePolicy = serde_json::from_str(&policy)
        .map_err(|e| RepositoryError::Query(format!("invalid policy JSON: {e}")))?;

    let protocols: String = row
        .try_get("protocols")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let protocols: Vec<String> = serde_json::from_str(&protocols)
        .map_err(|e| RepositoryError::Query(format!("invalid protocols JSON: {e}")))?;

    let healthy: i64 = row
        .try_get("healthy")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

    let last_heartbeat: Option<String> = row
        .try_get("last_heartbeat")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let last_heartbeat = last_heartbeat
        .as_deref()
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| RepositoryError::Query(format!("invalid heartbeat: {e}")))
        })
        .transpose()?;

    Ok(StageCapability {
        stage,
        version: row
            .try_get("version")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        description: row
            .try_get("description")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        policy,
        protocols,
        healthy: healthy != 0,
        last_heartbeat,
    })
}

impl CapabilityRepository for SqliteCapabilityRepository {
    async fn upsert_capability(&self, capability: &StageCapability) -> Result<(), RepositoryError> {
        let policy_json = serde_json::to_string(&capability.policy)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let protocols_json = serde_json::to_string(&capability.protocols)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO stage_capabilities
               (stage, version, description, policy, protocols, healthy, last_heartbeat)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(stage) DO UPDATE SET
                 version = excluded.version,
                 description = excluded.description,
                 policy = excluded.policy,
                 protocols = excluded.protocols,
                 healthy = excluded.healthy"#,
        )
        .bind(capability.stage.as_str())
        .bind(&capability.version)
        .bind(&capability.description)
        .bind(&policy_json)
        .bind(&protocols_json)
        .bind(capability.healthy as i64)
        .bind(capability.last_heartbeat.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_capability(
        &self,
        stage: StageName,
    ) -> Result<Option<StageCapability>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM stage_capabilities WHERE stage = ?")
            .bind(stage.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(capability_from_row).transpose()
    }

    async fn list_capabilities(&self) -> Result<Vec<StageCapability>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM stage_capabilities ORDER BY stage ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(capability_from_row).collect()
    }

    async fn touch_heartbeat(
        &self,
        stage: StageName,
        healthy: bool,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE stage_capabilities SET healthy = ?, last_heartbeat = ? WHERE stage = ?",
        )
        .bind(healthy as i64)
        .bind(format_datetime(&Utc::now()))
        .bind(stage.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get_capability() {
        let repo = SqliteCapabilityRepository::new(test_pool().await);
        let cap = StageCapability::new(StageName::Enrich, StagePolicy::default());

        repo.upsert_capability(&cap).await.unwrap();

        let loaded = repo.get_capability(StageName::Enrich).await.unwrap().unwrap();
        assert_eq!(loaded.stage, StageName::Enrich);
        assert_eq!(loaded.version, "1.0.0");
        assert!(loaded.healthy);
        assert_eq!(loaded.policy.retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_upsert_replaces_policy() {
        let repo = SqliteCapabilityRepository::new(test_pool().await);
        let mut cap = StageCapability::new(StageName::Embed, StagePolicy::default());
        repo.upsert_capability(&cap).await.unwrap();

        cap.policy.concurrency = 16;
        cap.version = "1.1.0".to_string();
        repo.upsert_capability(&cap).await.unwrap();

        let loaded = repo.get_capability(StageName::Embed).await.unwrap().unwrap();
        assert_eq!(loaded.policy.concurrency, 16);
        assert_eq!(loaded.version, "1.1.0");

        let all = repo.list_capabilities().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_touch_heartbeat() {
        let repo = SqliteCapabilityRepository::new(test_pool().await);
        let cap = StageCapability::new(StageName::Import, StagePolicy::default());
        repo.upsert_capability(&cap).await.unwrap();

        repo.touch_heartbeat(StageName::Import, true).await.unwrap();

        let loaded = repo.get_capability(StageName::Import).await.unwrap().unwrap();
        assert!(loaded.healthy);
        assert!(loaded.last_heartbeat.is_some());

        // Heartbeat for an unregistered stage fails
        let err = repo.touch_heartbeat(StageName::Embed, true).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_get_missing_capability_is_none() {
        let repo = SqliteCapabilityRepository::new(test_pool().await);
        assert!(repo.get_capability(StageName::Validate).await.unwrap().is_none());
    }
}
