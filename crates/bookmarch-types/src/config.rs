//! Engine configuration: the operator-facing per-stage policy table plus
//! runtime intervals.
//!
//! Loaded from `config.toml` in the data directory; every field has a
//! default so a missing or partial file still yields a working engine.
//! Stage policies seed the capability registry at startup and can be
//! hot-reloaded by re-registering a capability row.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stage::{RateWindow, RetrySettings, StageName, StagePolicy};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between health monitor ticks.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Worker idle poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long shutdown waits for in-flight jobs to drain.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Per-stage admission and retry policies. Stages absent from the file
    /// get the built-in defaults.
    #[serde(default)]
    pub stages: HashMap<StageName, StagePolicy>,
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stages: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// The effective policy for a stage: configured override or the
    /// stage's built-in default.
    pub fn policy_for(&self, stage: StageName) -> StagePolicy {
        self.stages
            .get(&stage)
            .copied()
            .unwrap_or_else(|| default_policy_for(stage))
    }
}

/// Built-in per-stage defaults.
///
/// The enrich/categorize/embed stages call an external AI service and get
/// tighter ceilings and rate windows than the local import/validate stages.
pub fn default_policy_for(stage: StageName) -> StagePolicy {
    match stage {
        StageName::Import => StagePolicy {
            concurrency: 4,
            rate: RateWindow {
                max_admissions: 60,
                window_secs: 60,
            },
            retry: RetrySettings::default(),
        },
        StageName::Validate => StagePolicy {
            concurrency: 8,
            rate: RateWindow {
                max_admissions: 120,
                window_secs: 60,
            },
            retry: RetrySettings::default(),
        },
        StageName::Enrich | StageName::Categorize => StagePolicy {
            concurrency: 2,
            rate: RateWindow {
                max_admissions: 30,
                window_secs: 60,
            },
            retry: RetrySettings::default(),
        },
        StageName::Embed => StagePolicy {
            concurrency: 2,
            rate: RateWindow {
                max_admissions: 60,
                window_secs: 60,
            },
            retry: RetrySettings::default(),
        },
    }
}
