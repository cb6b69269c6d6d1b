//! The uniform stage handler contract.
//!
//! A stage handler is the pluggable business logic behind one stage type
//! (URL validation, metadata enrichment, embedding generation, ...). The
//! orchestrator invokes handlers through this single `execute` method and
//! neither knows nor cares what a stage computes. A success becomes an
//! immutable artifact plus an optional context patch; an error goes to the
//! retry controller.
//!
//! Handlers must bound their own blocking calls (timeouts are a handler
//! concern); a handler that never returns surfaces through the health
//! monitor as a liveness fault.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bookmarch_types::error::StageError;
use bookmarch_types::stage::StageName;
use uuid::Uuid;

/// Everything a handler receives for one execution.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub task_id: Uuid,
    pub stage: StageName,
    /// 1-based attempt number (duplicate deliveries repeat the number, so
    /// handlers can key idempotent side effects by
    /// `(task_id, stage, attempt)`).
    pub attempt: u32,
    /// The task's current context, accumulated across earlier stages.
    pub context: serde_json::Value,
    /// The job payload carried through the queue.
    pub payload: serde_json::Value,
}

/// A successful handler result.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Domain type tag for the produced artifact.
    pub artifact_type: String,
    /// MIME type of the artifact payload.
    pub content_type: String,
    /// The artifact payload itself.
    pub artifact: serde_json::Value,
    /// Optional patch merged into the task context before the next stage
    /// runs (top-level keys overwrite).
    pub context_patch: Option<serde_json::Value>,
}

impl StageOutput {
    /// A JSON artifact with no context patch.
    pub fn json(artifact_type: &str, artifact: serde_json::Value) -> Self {
        Self {
            artifact_type: artifact_type.to_string(),
            content_type: "application/json".to_string(),
            artifact,
            context_patch: None,
        }
    }

    /// Attach a context patch.
    pub fn with_context_patch(mut self, patch: serde_json::Value) -> Self {
        self.context_patch = Some(patch);
        self
    }
}

/// The stage handler contract.
pub trait StageHandler: Send + Sync {
    /// Execute the stage's business logic for one job.
    fn execute(
        &self,
        input: StageInput,
    ) -> impl Future<Output = Result<StageOutput, StageError>> + Send;
}

/// Object-safe version of [`StageHandler`] with boxed futures.
///
/// `StageHandler` uses RPITIT, so it cannot be a trait object directly.
/// This trait exists solely to enable dynamic dispatch from the registry; a
/// blanket implementation covers every `StageHandler`.
pub trait StageHandlerDyn: Send + Sync {
    fn execute_boxed(
        &self,
        input: StageInput,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutput, StageError>> + Send + '_>>;
}

impl<T: StageHandler> StageHandlerDyn for T {
    fn execute_boxed(
        &self,
        input: StageInput,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutput, StageError>> + Send + '_>> {
        Box::pin(self.execute(input))
    }
}

/// Shared, type-erased handler handle as stored in the registry.
pub type SharedStageHandler = Arc<dyn StageHandlerDyn>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    impl StageHandler for EchoHandler {
        async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
            Ok(StageOutput::json("echo", json!({"attempt": input.attempt})))
        }
    }

    #[tokio::test]
    async fn blanket_impl_enables_dynamic_dispatch() {
        let handler: SharedStageHandler = Arc::new(EchoHandler);
        let input = StageInput {
            task_id: Uuid::now_v7(),
            stage: StageName::Import,
            attempt: 2,
            context: json!({}),
            payload: json!({}),
        };
        let output = handler.execute_boxed(input).await.unwrap();
        assert_eq!(output.artifact_type, "echo");
        assert_eq!(output.artifact["attempt"], 2);
    }

    #[test]
    fn output_builder_attaches_patch() {
        let output = StageOutput::json("report", json!({"ok": true}))
            .with_context_patch(json!({"validated": 10}));
        assert_eq!(output.content_type, "application/json");
        assert_eq!(output.context_patch.unwrap()["validated"], 10);
    }
}
