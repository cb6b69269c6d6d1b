//! The stage registry: handlers, capabilities, and workflow presets.
//!
//! Maps each registered `StageName` to its handler and capability row, and
//! holds the named workflow presets a submitter can reference instead of an
//! explicit stage list. Unregistered stage names are rejected at submission
//! time, never at execution time.

use std::sync::Arc;

use bookmarch_types::stage::{StageCapability, StageName, StagePolicy};
use dashmap::DashMap;

use super::handler::{SharedStageHandler, StageHandler};

/// One registered stage: its capability row plus the handler to invoke.
#[derive(Clone)]
pub struct StageEntry {
    pub capability: StageCapability,
    pub handler: SharedStageHandler,
}

/// Registry of stage handlers, capabilities, and workflow presets.
pub struct StageRegistry {
    stages: DashMap<StageName, StageEntry>,
    workflows: DashMap<String, Vec<StageName>>,
}

impl StageRegistry {
    /// An empty registry with the built-in workflow presets.
    pub fn new() -> Self {
        let registry = Self {
            stages: DashMap::new(),
            workflows: DashMap::new(),
        };

        // Built-in workflow presets
        registry.register_workflow(
            "bookmark_processing",
            vec![
                StageName::Import,
                StageName::Validate,
                StageName::Enrich,
                StageName::Categorize,
                StageName::Embed,
            ],
        );
        registry.register_workflow("import_only", vec![StageName::Import]);
        registry.register_workflow(
            "validate_enrich",
            vec![StageName::Validate, StageName::Enrich],
        );

        registry
    }

    /// Register (or replace) a stage's handler and capability.
    pub fn register<H: StageHandler + 'static>(&self, capability: StageCapability, handler: H) {
        let stage = capability.stage;
        tracing::info!(stage = %stage, version = capability.version.as_str(), "registering stage");
        self.stages.insert(
            stage,
            StageEntry {
                capability,
                handler: Arc::new(handler),
            },
        );
    }

    /// Whether a handler is registered for the stage.
    pub fn contains(&self, stage: StageName) -> bool {
        self.stages.contains_key(&stage)
    }

    /// Fetch a stage's entry (handler + capability).
    pub fn get(&self, stage: StageName) -> Option<StageEntry> {
        self.stages.get(&stage).map(|e| e.clone())
    }

    /// The effective admission/retry policy for a stage.
    ///
    /// Read live at each decision point, so a hot-reloaded policy applies
    /// to subsequent retries and admissions without a restart. (Concurrency
    /// semaphores are sized when the runtime starts.)
    pub fn policy(&self, stage: StageName) -> Option<StagePolicy> {
        self.stages.get(&stage).map(|e| e.capability.policy)
    }

    /// Replace a stage's policy (operator hot-reload). Returns `false` if
    /// the stage is not registered.
    pub fn update_policy(&self, stage: StageName, policy: StagePolicy) -> bool {
        match self.stages.get_mut(&stage) {
            Some(mut entry) => {
                entry.capability.policy = policy;
                true
            }
            None => false,
        }
    }

    /// All registered stages.
    pub fn registered_stages(&self) -> Vec<StageName> {
        self.stages.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot of every registered capability row.
    pub fn capabilities(&self) -> Vec<StageCapability> {
        self.stages.iter().map(|e| e.capability.clone()).collect()
    }

    /// Register (or replace) a named workflow preset.
    pub fn register_workflow(&self, name: &str, stages: Vec<StageName>) {
        self.workflows.insert(name.to_string(), stages);
    }

    /// Resolve a workflow preset to its stage list.
    pub fn resolve_workflow(&self, name: &str) -> Option<Vec<StageName>> {
        self.workflows.get(name).map(|s| s.clone())
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.registered_stages())
            .field("workflows", &self.workflows.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::handler::{StageInput, StageOutput};
    use bookmarch_types::error::StageError;
    use serde_json::json;

    struct NoopHandler;

    impl StageHandler for NoopHandler {
        async fn execute(&self, _input: StageInput) -> Result<StageOutput, StageError> {
            Ok(StageOutput::json("noop", json!({})))
        }
    }

    fn capability(stage: StageName) -> StageCapability {
        StageCapability::new(stage, StagePolicy::default())
    }

    #[test]
    fn builtin_workflow_presets() {
        let registry = StageRegistry::new();
        let full = registry.resolve_workflow("bookmark_processing").unwrap();
        assert_eq!(full.len(), 5);
        assert_eq!(full[0], StageName::Import);
        assert_eq!(full[4], StageName::Embed);

        assert_eq!(
            registry.resolve_workflow("import_only").unwrap(),
            vec![StageName::Import]
        );
        assert!(registry.resolve_workflow("no_such_workflow").is_none());
    }

    #[test]
    fn register_and_lookup() {
        let registry = StageRegistry::new();
        assert!(!registry.contains(StageName::Validate));

        registry.register(capability(StageName::Validate), NoopHandler);
        assert!(registry.contains(StageName::Validate));
        assert!(registry.get(StageName::Validate).is_some());
        assert_eq!(registry.registered_stages(), vec![StageName::Validate]);
    }

    #[test]
    fn update_policy_hot_reload() {
        let registry = StageRegistry::new();
        registry.register(capability(StageName::Enrich), NoopHandler);

        let mut policy = StagePolicy::default();
        policy.retry.max_attempts = 7;
        assert!(registry.update_policy(StageName::Enrich, policy));
        assert_eq!(registry.policy(StageName::Enrich).unwrap().retry.max_attempts, 7);

        // Unregistered stage cannot be updated
        assert!(!registry.update_policy(StageName::Embed, policy));
    }

    #[tokio::test]
    async fn entry_handler_is_invocable() {
        let registry = StageRegistry::new();
        registry.register(capability(StageName::Import), NoopHandler);

        let entry = registry.get(StageName::Import).unwrap();
        let output = entry
            .handler
            .execute_boxed(StageInput {
                task_id: uuid::Uuid::now_v7(),
                stage: StageName::Import,
                attempt: 1,
                context: json!({}),
                payload: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(output.artifact_type, "noop");
    }
}
