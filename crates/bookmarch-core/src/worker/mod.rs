//! Per-stage worker pools: queue consumption under admission control.
//!
//! Each registered stage owns one pool of consumers bound to that stage's
//! queue. A consumer claims a job only after passing the governor (a free
//! concurrency slot and rate-window capacity), re-validates the task
//! against the job (the staleness guard lives in
//! [`Orchestrator::begin_stage`]), invokes the registered handler, and
//! reports the outcome straight back to the orchestrator. Completion is an
//! explicit return value -- there are no queue-library callbacks.

pub mod governor;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bookmarch_types::job::{queue_for, QueueJob};
use bookmarch_types::stage::StageName;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use crate::repository::TaskRepository;
use crate::stage::handler::StageInput;
use self::governor::StageGovernor;

/// Upper bound on a single park interval, so cancellation and hot-reloaded
/// rate windows are noticed promptly.
const MAX_PARK: Duration = Duration::from_secs(1);

/// A pool of consumers for one stage's queue.
pub struct StageWorkerPool<R: TaskRepository, Q: JobQueue> {
    stage: StageName,
    orchestrator: Arc<Orchestrator<R, Q>>,
    governor: Arc<StageGovernor>,
    poll_interval: Duration,
}

impl<R, Q> StageWorkerPool<R, Q>
where
    R: TaskRepository + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(
        stage: StageName,
        orchestrator: Arc<Orchestrator<R, Q>>,
        governor: Arc<StageGovernor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stage,
            orchestrator,
            governor,
            poll_interval,
        }
    }

    /// The governor shared by this pool's consumers.
    pub fn governor(&self) -> &Arc<StageGovernor> {
        &self.governor
    }

    /// Spawn one consumer task per concurrency slot.
    ///
    /// Consumers run until the token is cancelled; an in-flight job is
    /// finished (and acknowledged) before its consumer exits, which is what
    /// makes shutdown a drain rather than an abort.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let consumers = self.governor.capacity();
        tracing::info!(stage = %self.stage, consumers, "starting stage worker pool");
        (0..consumers)
            .map(|index| {
                let pool = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.consumer_loop(index, cancel).await })
            })
            .collect()
    }

    async fn consumer_loop(&self, index: u32, cancel: CancellationToken) {
        let queue_name = queue_for(self.stage);
        tracing::debug!(stage = %self.stage, index, "consumer started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.governor.acquire_slot() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };

            // Rate admission is checked before pulling the next job; an
            // exhausted window parks the consumer until capacity frees.
            let window = self
                .orchestrator
                .registry()
                .policy(self.stage)
                .map(|p| p.rate)
                .unwrap_or_default();
            if let Err(wait) = self.governor.rate_check(&window, Instant::now()) {
                drop(permit);
                if self.park(wait.min(MAX_PARK), &cancel).await {
                    break;
                }
                continue;
            }

            match self.orchestrator.queue().claim(&queue_name).await {
                Ok(Some(job)) => {
                    self.governor.record_admission(Instant::now());
                    self.process_job(job).await;
                    drop(permit);
                }
                Ok(None) => {
                    drop(permit);
                    if self.park(self.poll_interval, &cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(stage = %self.stage, error = %e, "queue claim failed");
                    drop(permit);
                    if self.park(self.poll_interval, &cancel).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(stage = %self.stage, index, "consumer stopped");
    }

    /// Sleep for `duration` unless cancelled. Returns `true` on cancel.
    async fn park(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Execute one claimed job end to end and acknowledge it.
    async fn process_job(&self, job: QueueJob) {
        let job_id = job.id;

        match self.orchestrator.begin_stage(&job).await {
            Ok(Some(task)) => {
                let Some(entry) = self.orchestrator.registry().get(self.stage) else {
                    // Registration is checked at submission; losing the
                    // handler mid-flight still must not strand the task.
                    let result = self
                        .orchestrator
                        .advance_on_failure(
                            job.task_id,
                            job.stage,
                            job.attempt,
                            "stage handler not registered",
                        )
                        .await;
                    if let Err(e) = result {
                        tracing::error!(task_id = %job.task_id, error = %e, "failure report failed");
                    }
                    self.ack(&job_id).await;
                    return;
                };

                let input = StageInput {
                    task_id: task.id,
                    stage: job.stage,
                    attempt: job.attempt,
                    context: task.context.clone(),
                    payload: job.payload.clone(),
                };

                let started = Instant::now();
                let result = entry.handler.execute_boxed(input).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let report = match result {
                    Ok(output) => {
                        self.orchestrator
                            .advance_on_success(task.id, job.stage, duration_ms, output)
                            .await
                    }
                    Err(err) => {
                        self.orchestrator
                            .advance_on_failure(task.id, job.stage, job.attempt, &err.to_string())
                            .await
                    }
                };
                if let Err(e) = report {
                    tracing::error!(task_id = %task.id, stage = %job.stage, error = %e, "advancement failed");
                }
            }
            Ok(None) => {
                // Stale or duplicate delivery; drop it.
            }
            Err(e) => {
                tracing::error!(task_id = %job.task_id, stage = %job.stage, error = %e, "begin_stage failed");
            }
        }

        self.ack(&job_id).await;
    }

    async fn ack(&self, job_id: &uuid::Uuid) {
        if let Err(e) = self.orchestrator.queue().ack(job_id).await {
            tracing::warn!(%job_id, error = %e, "job ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::handler::{StageHandler, StageOutput};
    use crate::test_support::{succeeding_handler, FlakyHandler, TestHarness};
    use bookmarch_types::error::StageError;
    use bookmarch_types::stage::{
        RateWindow, RetrySettings, StageCapability, StagePolicy, StageStatus,
    };
    use bookmarch_types::task::TaskStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry_policy(concurrency: u32) -> StagePolicy {
        StagePolicy {
            concurrency,
            rate: RateWindow {
                max_admissions: 10_000,
                window_secs: 60,
            },
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 10,
            },
        }
    }

    fn spawn_pool(
        h: &TestHarness,
        stage: StageName,
        concurrency: u32,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(StageWorkerPool::new(
            stage,
            Arc::clone(&h.orchestrator),
            Arc::new(StageGovernor::new(concurrency)),
            Duration::from_millis(5),
        ));
        pool.spawn(cancel.clone())
    }

    async fn wait_for_status(h: &TestHarness, task_id: uuid::Uuid, status: TaskStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let task = h.repository.get_task(&task_id).await.unwrap().unwrap();
            if task.status == status {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "task never reached {status} (stuck at {})",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_drives_two_stage_task_to_completion() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("bookmark_list"));
        h.register(StageName::Validate, succeeding_handler("validation_report"));

        let cancel = CancellationToken::new();
        let mut handles = spawn_pool(&h, StageName::Import, 2, &cancel);
        handles.extend(spawn_pool(&h, StageName::Validate, 2, &cancel));

        let task = h
            .orchestrator
            .create_task(
                "custom",
                Some(vec![StageName::Import, StageName::Validate]),
                json!({}),
                "user-1",
            )
            .await
            .unwrap();

        wait_for_status(&h, task.id, TaskStatus::Completed).await;

        let artifacts = h.repository.list_artifacts(&task.id).await.unwrap();
        assert_eq!(artifacts.len(), 2);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_retries_flaky_stage_until_success() {
        let h = TestHarness::new();
        h.registry.register(
            StageCapability::new(StageName::Validate, fast_retry_policy(2)),
            FlakyHandler::new(2),
        );

        let cancel = CancellationToken::new();
        let handles = spawn_pool(&h, StageName::Validate, 2, &cancel);

        let task = h
            .orchestrator
            .create_task("custom", Some(vec![StageName::Validate]), json!({}), "u")
            .await
            .unwrap();

        wait_for_status(&h, task.id, TaskStatus::Completed).await;

        let row = h
            .repository
            .get_stage(&task.id, StageName::Validate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.attempts, 3);
        assert_eq!(row.status, StageStatus::Completed);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_exhausts_retries_and_fails_task() {
        let h = TestHarness::new();
        h.registry.register(
            StageCapability::new(StageName::Enrich, fast_retry_policy(1)),
            FlakyHandler::new(10),
        );

        let cancel = CancellationToken::new();
        let handles = spawn_pool(&h, StageName::Enrich, 1, &cancel);

        let task = h
            .orchestrator
            .create_task("custom", Some(vec![StageName::Enrich]), json!({}), "u")
            .await
            .unwrap();

        wait_for_status(&h, task.id, TaskStatus::Failed).await;

        let failed = h.repository.get_task(&task.id).await.unwrap().unwrap();
        assert!(failed.error_message.is_some());
        assert!(h.repository.list_artifacts(&task.id).await.unwrap().is_empty());

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    struct ConcurrencyProbe {
        current: Arc<AtomicU32>,
        max_seen: Arc<AtomicU32>,
    }

    impl StageHandler for ConcurrencyProbe {
        async fn execute(
            &self,
            _input: crate::stage::handler::StageInput,
        ) -> Result<StageOutput, StageError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(StageOutput::json("probe", json!({})))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrency_ceiling_is_respected() {
        let h = TestHarness::new();
        let current = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        h.register(
            StageName::Import,
            ConcurrencyProbe {
                current: Arc::clone(&current),
                max_seen: Arc::clone(&max_seen),
            },
        );

        let cancel = CancellationToken::new();
        let handles = spawn_pool(&h, StageName::Import, 2, &cancel);

        let mut task_ids = Vec::new();
        for _ in 0..6 {
            let task = h
                .orchestrator
                .create_task("import_only", None, json!({}), "u")
                .await
                .unwrap();
            task_ids.push(task.id);
        }

        for task_id in task_ids {
            wait_for_status(&h, task_id, TaskStatus::Completed).await;
        }

        assert!(
            max_seen.load(Ordering::SeqCst) <= 2,
            "observed {} concurrent executions over ceiling 2",
            max_seen.load(Ordering::SeqCst)
        );

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consumers_exit_promptly_on_cancel() {
        let h = TestHarness::new();
        h.register(StageName::Import, succeeding_handler("x"));

        let cancel = CancellationToken::new();
        let handles = spawn_pool(&h, StageName::Import, 2, &cancel);

        cancel.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .await;
        assert!(joined.is_ok(), "consumers must exit after cancellation");
    }
}
