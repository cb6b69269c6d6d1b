//! Append-only task messages: the progress/audit trail.
//!
//! Messages are never mutated. Per task they are strictly ordered by
//! `(timestamp, id)`; IDs are UUIDv7 so the tiebreak is itself time-ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::StageName;

/// The kind of a progress/audit message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Progress,
    Status,
    Error,
    Warning,
    Info,
    Completion,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::Progress => "progress",
            MessageKind::Status => "status",
            MessageKind::Error => "error",
            MessageKind::Warning => "warning",
            MessageKind::Info => "info",
            MessageKind::Completion => "completion",
        };
        f.write_str(s)
    }
}

/// One append-only progress/audit entry for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// UUIDv7 message ID.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// Stage the message relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Structured extras, e.g. a numeric percent on progress messages.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Message {
    /// Create a new message of the given kind.
    pub fn new(task_id: Uuid, stage: Option<StageName>, kind: MessageKind, content: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            stage,
            kind,
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// A progress message carrying `current`/`total`/`percentage` metadata.
    pub fn progress(
        task_id: Uuid,
        stage: StageName,
        current: usize,
        total: usize,
        content: &str,
    ) -> Self {
        let mut msg = Self::new(task_id, Some(stage), MessageKind::Progress, content);
        let percentage = if total == 0 {
            100
        } else {
            (current as f64 / total as f64 * 100.0) as u8
        };
        msg.metadata = serde_json::json!({
            "current": current,
            "total": total,
            "percentage": percentage,
        });
        msg
    }

    pub fn info(task_id: Uuid, content: &str) -> Self {
        Self::new(task_id, None, MessageKind::Info, content)
    }

    pub fn error(task_id: Uuid, stage: Option<StageName>, content: &str) -> Self {
        Self::new(task_id, stage, MessageKind::Error, content)
    }

    pub fn warning(task_id: Uuid, stage: Option<StageName>, content: &str) -> Self {
        Self::new(task_id, stage, MessageKind::Warning, content)
    }

    pub fn completion(task_id: Uuid, stage: Option<StageName>, content: &str) -> Self {
        Self::new(task_id, stage, MessageKind::Completion, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_message_metadata() {
        let msg = Message::progress(Uuid::now_v7(), StageName::Validate, 50, 200, "validating");
        assert_eq!(msg.kind, MessageKind::Progress);
        assert_eq!(msg.metadata["current"], 50);
        assert_eq!(msg.metadata["total"], 200);
        assert_eq!(msg.metadata["percentage"], 25);
    }

    #[test]
    fn progress_with_zero_total_is_complete() {
        let msg = Message::progress(Uuid::now_v7(), StageName::Import, 0, 0, "empty import");
        assert_eq!(msg.metadata["percentage"], 100);
    }

    #[test]
    fn constructors_set_kind_and_stage() {
        let task_id = Uuid::now_v7();
        assert_eq!(Message::info(task_id, "hi").kind, MessageKind::Info);
        let err = Message::error(task_id, Some(StageName::Enrich), "boom");
        assert_eq!(err.kind, MessageKind::Error);
        assert_eq!(err.stage, Some(StageName::Enrich));
        assert_eq!(
            Message::completion(task_id, None, "done").kind,
            MessageKind::Completion
        );
    }

    #[test]
    fn ids_are_time_ordered() {
        let task_id = Uuid::now_v7();
        let a = Message::info(task_id, "first");
        let b = Message::info(task_id, "second");
        assert!(a.id < b.id, "UUIDv7 IDs must sort by creation order");
    }

    #[test]
    fn message_json_roundtrip() {
        let msg = Message::warning(Uuid::now_v7(), Some(StageName::Embed), "slow model");
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, msg.id);
        assert_eq!(parsed.kind, MessageKind::Warning);
        assert_eq!(parsed.stage, Some(StageName::Embed));
    }
}
