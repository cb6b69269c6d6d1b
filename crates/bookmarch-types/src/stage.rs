//! Stage domain types: the closed stage-name enum, per-task stage progress,
//! and the capability registry entry describing a stage type's runtime
//! identity and admission policy.
//!
//! Stage names form a closed set -- one per bookmark-processing stage. An
//! unknown name fails at parse time, so a workflow referencing it is rejected
//! at submission rather than at execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StageName
// ---------------------------------------------------------------------------

/// The closed set of pipeline stages.
///
/// Each stage owns one durable queue and one worker pool. Workflows are
/// ordered lists drawn from this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Ingest bookmarks into the pipeline.
    Import,
    /// Check each bookmark URL is reachable.
    Validate,
    /// Fetch page metadata (title, description, favicon).
    Enrich,
    /// Assign categories and tags.
    Categorize,
    /// Generate semantic embeddings.
    Embed,
}

impl StageName {
    /// All stages, in canonical pipeline order.
    pub const ALL: [StageName; 5] = [
        StageName::Import,
        StageName::Validate,
        StageName::Enrich,
        StageName::Categorize,
        StageName::Embed,
    ];

    /// Stable snake_case identifier, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Import => "import",
            StageName::Validate => "validate",
            StageName::Enrich => "enrich",
            StageName::Categorize => "categorize",
            StageName::Embed => "embed",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(StageName::Import),
            "validate" => Ok(StageName::Validate),
            "enrich" => Ok(StageName::Enrich),
            "categorize" => Ok(StageName::Categorize),
            "embed" => Ok(StageName::Embed),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

/// Error for a stage name outside the closed set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown stage: '{0}'")]
pub struct UnknownStage(pub String);

// ---------------------------------------------------------------------------
// Stage execution status
// ---------------------------------------------------------------------------

/// Status of one stage's execution within one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Whether this status admits no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// StageProgress
// ---------------------------------------------------------------------------

/// Durable record of one stage's execution state within one task.
///
/// Keyed by `(task_id, stage)`. Created when the stage is first enqueued;
/// mutated by the worker executing the stage and by the retry controller;
/// deleted only when the owning task is purged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    /// Owning task.
    pub task_id: Uuid,
    /// Which stage this row tracks.
    pub stage: StageName,
    /// Position of the stage in the task's declared stage list (0-based).
    pub stage_index: usize,
    /// Current execution status.
    pub status: StageStatus,
    /// Number of attempts started (1-based once execution begins).
    pub attempts: u32,
    /// Error message from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Opaque handle into the queue broker for the outstanding job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<String>,
    /// Free-form handler-reported progress (e.g. percent complete).
    #[serde(default)]
    pub progress_data: serde_json::Value,
    /// When the first attempt began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageProgress {
    /// A fresh pending row for a stage about to be enqueued.
    pub fn pending(task_id: Uuid, stage: StageName, stage_index: usize) -> Self {
        Self {
            task_id,
            stage,
            stage_index,
            status: StageStatus::Pending,
            attempts: 0,
            last_error: None,
            job_ref: None,
            progress_data: serde_json::Value::Object(Default::default()),
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Admission policy
// ---------------------------------------------------------------------------

/// Rolling rate window: at most `max_admissions` job starts per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub max_admissions: u32,
    pub window_secs: u64,
}

impl Default for RateWindow {
    fn default() -> Self {
        Self {
            max_admissions: 60,
            window_secs: 60,
        }
    }
}

/// Retry settings for a stage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of attempts (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each further attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Admission and retry policy for one stage type.
///
/// Configuration, not task state: shared across all tasks of a stage type,
/// read at startup and hot-reloadable by re-registering the capability row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicy {
    /// Maximum simultaneous in-flight executions.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Rolling admission rate window.
    #[serde(default)]
    pub rate: RateWindow,
    /// Retry/backoff settings.
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_concurrency() -> u32 {
    4
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rate: RateWindow::default(),
            retry: RetrySettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// StageCapability
// ---------------------------------------------------------------------------

/// Registry entry describing a stage type's runtime identity.
///
/// Low-churn service-discovery record: version, admission policy, accepted
/// protocols, and health/heartbeat status. Not per-task state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCapability {
    pub stage: StageName,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub policy: StagePolicy,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

fn default_healthy() -> bool {
    true
}

impl StageCapability {
    /// A capability row with the given policy and default identity fields.
    pub fn new(stage: StageName, policy: StagePolicy) -> Self {
        Self {
            stage,
            version: "1.0.0".to_string(),
            description: String::new(),
            policy,
            protocols: vec!["json".to_string()],
            healthy: true,
            last_heartbeat: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
