//! The engine runtime: explicit ownership of worker pools and the health
//! loop, with a start/shutdown lifecycle.
//!
//! There is no ambient or global singleton: the runtime is a constructed
//! value owning one consumer-pool handle per registered stage, a shared
//! cancellation token, and the health monitor. `shutdown` cancels the token
//! and then joins every spawned task, so in-flight jobs drain before
//! resources are released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bookmarch_types::config::EngineConfig;
use bookmarch_types::error::OrchestratorError;
use bookmarch_types::stage::StageName;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::{HealthMonitor, HealthSnapshot};
use crate::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use crate::repository::capability::CapabilityRepository;
use crate::repository::task::TaskRepository;
use crate::worker::governor::StageGovernor;
use crate::worker::StageWorkerPool;

/// Owns the engine's background execution: stage worker pools plus the
/// health monitor.
pub struct EngineRuntime<R, C, Q>
where
    R: TaskRepository + 'static,
    C: CapabilityRepository + 'static,
    Q: JobQueue + 'static,
{
    config: EngineConfig,
    orchestrator: Arc<Orchestrator<R, Q>>,
    capabilities: Arc<C>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    governors: Mutex<HashMap<StageName, Arc<StageGovernor>>>,
    health_tx: watch::Sender<Option<HealthSnapshot>>,
    health_rx: watch::Receiver<Option<HealthSnapshot>>,
}

impl<R, C, Q> EngineRuntime<R, C, Q>
where
    R: TaskRepository + 'static,
    C: CapabilityRepository + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(
        config: EngineConfig,
        orchestrator: Arc<Orchestrator<R, Q>>,
        capabilities: Arc<C>,
    ) -> Self {
        let (health_tx, health_rx) = watch::channel(None);
        Self {
            config,
            orchestrator,
            capabilities,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            governors: Mutex::new(HashMap::new()),
            health_tx,
            health_rx,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<R, Q>> {
        &self.orchestrator
    }

    pub fn capabilities(&self) -> &Arc<C> {
        &self.capabilities
    }

    /// A receiver for the latest health snapshot (None until the first
    /// tick).
    pub fn health(&self) -> watch::Receiver<Option<HealthSnapshot>> {
        self.health_rx.clone()
    }

    /// The governor for a stage, once started.
    pub fn governor(&self, stage: StageName) -> Option<Arc<StageGovernor>> {
        self.governors.lock().expect("runtime lock poisoned").get(&stage).cloned()
    }

    /// Start worker pools for every registered stage and the health loop.
    ///
    /// Persists each registered capability row first, so the registry's
    /// view is durable and discoverable before any job runs.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let registry = self.orchestrator.registry();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(10));

        for capability in registry.capabilities() {
            self.capabilities.upsert_capability(&capability).await?;
        }

        let mut governors = HashMap::new();
        let mut handles = Vec::new();

        for stage in registry.registered_stages() {
            let policy = registry.policy(stage).unwrap_or_default();
            let governor = Arc::new(StageGovernor::new(policy.concurrency));
            governors.insert(stage, Arc::clone(&governor));

            let pool = Arc::new(StageWorkerPool::new(
                stage,
                Arc::clone(&self.orchestrator),
                governor,
                poll_interval,
            ));
            handles.extend(pool.spawn(self.cancel.clone()));
        }

        let monitor = HealthMonitor::new(
            Arc::clone(self.orchestrator.repository()),
            Arc::clone(&self.capabilities),
            Arc::clone(self.orchestrator.queue()),
            governors.clone(),
            Duration::from_secs(self.config.health_interval_secs.max(1)),
            self.health_tx.clone(),
        );
        handles.push(tokio::spawn(monitor.run(self.cancel.clone())));

        *self.governors.lock().expect("runtime lock poisoned") = governors;
        self.handles
            .lock()
            .expect("runtime lock poisoned")
            .extend(handles);

        tracing::info!(
            stages = self.orchestrator.registry().registered_stages().len(),
            "engine runtime started"
        );
        Ok(())
    }

    /// Cancel all background work and wait for in-flight jobs to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.handles.lock().expect("runtime lock poisoned"),
        );

        let grace = Duration::from_secs(self.config.shutdown_grace_secs.max(1));
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "worker task join failed");
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(grace_secs = grace.as_secs(), "shutdown grace elapsed before drain completed");
        }
        tracing::info!("engine runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::capability::CapabilityRepository;
    use crate::repository::task::TaskRepository;
    use crate::test_support::{succeeding_handler, MemoryCapabilityRepository, TestHarness};
    use bookmarch_types::task::TaskStatus;
    use serde_json::json;
    use std::time::Instant;

    fn runtime_for(
        h: &TestHarness,
        capabilities: Arc<MemoryCapabilityRepository>,
        health_interval_secs: u64,
    ) -> EngineRuntime<
        crate::test_support::MemoryTaskRepository,
        MemoryCapabilityRepository,
        crate::test_support::MemoryJobQueue,
    > {
        let config = EngineConfig {
            health_interval_secs,
            poll_interval_ms: 10,
            shutdown_grace_secs: 5,
            stages: Default::default(),
        };
        EngineRuntime::new(config, Arc::clone(&h.orchestrator), capabilities)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_seeds_capabilities_and_processes_tasks() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("bookmark_list"));
        h.register(StageName::Validate, succeeding_handler("validation_report"));

        let capabilities = Arc::new(MemoryCapabilityRepository::new());
        let runtime = runtime_for(&h, Arc::clone(&capabilities), 1);
        runtime.start().await.unwrap();

        // Capability rows were persisted at startup
        assert_eq!(capabilities.list_capabilities().await.unwrap().len(), 2);
        assert!(runtime.governor(StageName::Import).is_some());

        let task = h
            .orchestrator
            .create_task(
                "custom",
                Some(vec![StageName::Import, StageName::Validate]),
                json!({}),
                "u",
            )
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let current = h.repository.get_task(&task.id).await.unwrap().unwrap();
            if current.status == TaskStatus::Completed {
                break;
            }
            assert!(Instant::now() < deadline, "task did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_without_start_is_a_noop() {
        let h = TestHarness::new();
        let capabilities = Arc::new(MemoryCapabilityRepository::new());
        let runtime = runtime_for(&h, capabilities, 60);
        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn health_snapshot_appears_after_tick() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));

        let capabilities = Arc::new(MemoryCapabilityRepository::new());
        let runtime = runtime_for(&h, capabilities, 1);
        runtime.start().await.unwrap();

        let mut rx = runtime.health();
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow().is_some() {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await;
        assert!(got.is_ok(), "health snapshot must be published");

        let snapshot = rx.borrow().clone().unwrap();
        assert_eq!(snapshot.stages.len(), 1);
        assert_eq!(snapshot.stages[0].stage, StageName::Import);

        runtime.shutdown().await;
    }
}
