//! Stage capability registry repository trait definition.
//!
//! Capability rows describe a stage type's runtime identity (version,
//! admission policy, protocols, health). They are low-churn: written at
//! startup from configuration, re-written on operator hot-reload, and
//! heartbeat-touched by the health monitor.

use bookmarch_types::error::RepositoryError;
use bookmarch_types::stage::{StageCapability, StageName};

/// Repository trait for stage capability persistence.
pub trait CapabilityRepository: Send + Sync {
    /// Insert or replace a capability row (keyed by stage name).
    fn upsert_capability(
        &self,
        capability: &StageCapability,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get one capability row.
    fn get_capability(
        &self,
        stage: StageName,
    ) -> impl std::future::Future<Output = Result<Option<StageCapability>, RepositoryError>> + Send;

    /// List all capability rows.
    fn list_capabilities(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StageCapability>, RepositoryError>> + Send;

    /// Update a stage's heartbeat timestamp and health flag.
    fn touch_heartbeat(
        &self,
        stage: StageName,
        healthy: bool,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
