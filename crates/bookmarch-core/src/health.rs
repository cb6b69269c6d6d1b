//! Periodic health monitoring across stage pools and active workflows.
//!
//! The monitor runs on a fixed interval driven by a cancellable ticker
//! owned by the runtime. Each tick it counts live tasks, reads per-stage
//! queue depths, snapshots governor occupancy, and touches capability
//! heartbeats, then publishes a [`HealthSnapshot`] on a watch channel for
//! the API. It never mutates task or stage-progress state, and a missed or
//! slow tick never blocks task processing -- collection errors degrade the
//! snapshot instead of failing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bookmarch_types::stage::StageName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;
use crate::repository::capability::CapabilityRepository;
use crate::repository::task::TaskRepository;
use crate::worker::governor::StageGovernor;

/// Health of one stage pool at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct StageHealth {
    pub stage: StageName,
    /// Jobs in the stage's queue (claimed or waiting).
    pub queue_depth: u64,
    /// Jobs buried in the stage's dead-letter queue.
    pub dead_letter_depth: u64,
    /// Executions currently holding a concurrency slot.
    pub in_flight: u32,
    /// Configured concurrency ceiling.
    pub capacity: u32,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Aggregate health snapshot across the engine.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub running_tasks: u64,
    pub pending_tasks: u64,
    pub stages: Vec<StageHealth>,
}

/// Periodic health collector.
pub struct HealthMonitor<R, C, Q> {
    repository: Arc<R>,
    capabilities: Arc<C>,
    queue: Arc<Q>,
    governors: HashMap<StageName, Arc<StageGovernor>>,
    interval: Duration,
    sender: watch::Sender<Option<HealthSnapshot>>,
}

impl<R, C, Q> HealthMonitor<R, C, Q>
where
    R: TaskRepository,
    C: CapabilityRepository,
    Q: JobQueue,
{
    pub fn new(
        repository: Arc<R>,
        capabilities: Arc<C>,
        queue: Arc<Q>,
        governors: HashMap<StageName, Arc<StageGovernor>>,
        interval: Duration,
        sender: watch::Sender<Option<HealthSnapshot>>,
    ) -> Self {
        Self {
            repository,
            capabilities,
            queue,
            governors,
            interval,
            sender,
        }
    }

    /// Run the tick loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.collect().await;
                    tracing::debug!(
                        running = snapshot.running_tasks,
                        stages = snapshot.stages.len(),
                        "health tick"
                    );
                    let _ = self.sender.send(Some(snapshot));
                }
            }
        }
        tracing::debug!("health monitor stopped");
    }

    /// Collect one snapshot. Errors are logged and degrade the affected
    /// fields rather than aborting the tick.
    pub async fn collect(&self) -> HealthSnapshot {
        let running_tasks = self
            .repository
            .count_tasks_with_status(bookmarch_types::task::TaskStatus::Running)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "health: running-task count failed");
                0
            });
        let pending_tasks = self
            .repository
            .count_tasks_with_status(bookmarch_types::task::TaskStatus::Pending)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "health: pending-task count failed");
                0
            });

        let mut stages = Vec::with_capacity(self.governors.len());
        for (stage, governor) in &self.governors {
            let queue_depth = self
                .queue
                .depth(&bookmarch_types::job::queue_for(*stage))
                .await
                .unwrap_or(0);
            let dead_letter_depth = self
                .queue
                .depth(&bookmarch_types::job::dead_letter_for(*stage))
                .await
                .unwrap_or(0);

            // A live pool heartbeats its capability row each tick.
            let healthy = true;
            if let Err(e) = self.capabilities.touch_heartbeat(*stage, healthy).await {
                tracing::warn!(stage = %stage, error = %e, "health: heartbeat touch failed");
            }
            let last_heartbeat = self
                .capabilities
                .get_capability(*stage)
                .await
                .ok()
                .flatten()
                .and_then(|c| c.last_heartbeat);

            stages.push(StageHealth {
                stage: *stage,
                queue_depth,
                dead_letter_depth,
                in_flight: governor.in_flight(),
                capacity: governor.capacity(),
                healthy,
                last_heartbeat,
            });
        }
        stages.sort_by_key(|s| s.stage.as_str());

        HealthSnapshot {
            generated_at: Utc::now(),
            running_tasks,
            pending_tasks,
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use crate::repository::capability::CapabilityRepository;
    use crate::test_support::{MemoryCapabilityRepository, MemoryJobQueue, MemoryTaskRepository};
    use bookmarch_types::job::{queue_for, QueueJob};
    use bookmarch_types::stage::{StageCapability, StagePolicy};

    fn monitor(
        repository: Arc<MemoryTaskRepository>,
        capabilities: Arc<MemoryCapabilityRepository>,
        queue: Arc<MemoryJobQueue>,
        interval: Duration,
    ) -> (
        HealthMonitor<MemoryTaskRepository, MemoryCapabilityRepository, MemoryJobQueue>,
        watch::Receiver<Option<HealthSnapshot>>,
    ) {
        let mut governors = HashMap::new();
        governors.insert(StageName::Import, Arc::new(StageGovernor::new(2)));
        let (tx, rx) = watch::channel(None);
        (
            HealthMonitor::new(repository, capabilities, queue, governors, interval, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn collect_reports_queue_depth_and_capacity() {
        let repository = Arc::new(MemoryTaskRepository::new());
        let capabilities = Arc::new(MemoryCapabilityRepository::new());
        let queue = Arc::new(MemoryJobQueue::new());

        capabilities
            .upsert_capability(&StageCapability::new(
                StageName::Import,
                StagePolicy::default(),
            ))
            .await
            .unwrap();
        let job = QueueJob::immediate(uuid::Uuid::now_v7(), StageName::Import, 1);
        queue.enqueue(&queue_for(StageName::Import), &job).await.unwrap();

        let (monitor, _rx) = monitor(repository, capabilities.clone(), queue, Duration::from_secs(60));
        let snapshot = monitor.collect().await;

        assert_eq!(snapshot.running_tasks, 0);
        assert_eq!(snapshot.stages.len(), 1);
        let stage = &snapshot.stages[0];
        assert_eq!(stage.stage, StageName::Import);
        assert_eq!(stage.queue_depth, 1);
        assert_eq!(stage.dead_letter_depth, 0);
        assert_eq!(stage.capacity, 2);
        assert_eq!(stage.in_flight, 0);
        assert!(stage.last_heartbeat.is_some(), "tick must touch heartbeat");
    }

    #[tokio::test]
    async fn run_publishes_snapshots_until_cancelled() {
        let repository = Arc::new(MemoryTaskRepository::new());
        let capabilities = Arc::new(MemoryCapabilityRepository::new());
        let queue = Arc::new(MemoryJobQueue::new());
        capabilities
            .upsert_capability(&StageCapability::new(
                StageName::Import,
                StagePolicy::default(),
            ))
            .await
            .unwrap();

        let (monitor, mut rx) = monitor(
            repository,
            capabilities,
            queue,
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        // Wait for the first published snapshot
        let got = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                rx.changed().await.unwrap();
                if rx.borrow().is_some() {
                    break;
                }
            }
        })
        .await;
        assert!(got.is_ok(), "monitor must publish a snapshot");

        cancel.cancel();
        handle.await.unwrap();
    }
}
