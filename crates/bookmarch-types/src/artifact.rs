//! Immutable artifacts: the durable outputs of successful stage executions.
//!
//! Artifacts are write-once. There is no update operation anywhere in the
//! system; the store rejects a second insert under the same ID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::StageName;

/// Immutable output produced by one successful stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// UUIDv7 artifact ID.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// Stage that produced this artifact.
    pub producing_stage: StageName,
    /// Domain type tag (e.g. "bookmark_list", "validation_report").
    pub artifact_type: String,
    /// MIME type of the payload.
    pub content_type: String,
    /// The payload document.
    pub payload: serde_json::Value,
    /// SHA-256 hex digest of the canonical payload JSON, set by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Payload size in bytes, set by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create a new artifact with a fresh ID. Checksum and size are filled
    /// in by the artifact store at write time.
    pub fn new(
        task_id: Uuid,
        producing_stage: StageName,
        artifact_type: &str,
        content_type: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            producing_stage,
            artifact_type: artifact_type.to_string(),
            content_type: content_type.to_string(),
            payload,
            checksum: None,
            size_bytes: None,
            created_at: Utc::now(),
        }
    }

    /// A bookmark-list artifact, as produced by the import stage.
    pub fn bookmark_list(task_id: Uuid, bookmark_ids: Vec<String>) -> Self {
        let total = bookmark_ids.len();
        Self::new(
            task_id,
            StageName::Import,
            "bookmark_list",
            "application/json",
            serde_json::json!({
                "bookmark_ids": bookmark_ids,
                "total_bookmarks": total,
            }),
        )
    }

    /// A validation-report artifact, as produced by the validate stage.
    pub fn validation_report(task_id: Uuid, results: Vec<ValidationResult>) -> Self {
        let total = results.len();
        let valid = results.iter().filter(|r| r.is_valid).count();
        let invalid = total - valid;
        Self::new(
            task_id,
            StageName::Validate,
            "validation_report",
            "application/json",
            serde_json::json!({
                "results": results,
                "summary": {
                    "total": total,
                    "valid": valid,
                    "invalid": invalid,
                }
            }),
        )
    }
}

/// Per-bookmark outcome inside a validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub bookmark_id: String,
    pub url: String,
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}
