//! Queue broker trait definition (the port to the durable job queue).
//!
//! Named, durable queues with at-least-once delivery: a claimed job that is
//! never acknowledged becomes claimable again after its lease expires, so
//! consumers must tolerate duplicate delivery. Backoff delays are expressed
//! as a future `available_at` on the job.

use bookmarch_types::error::QueueError;
use bookmarch_types::job::QueueJob;
use uuid::Uuid;

/// Uniform enqueue/consume interface over named durable queues.
pub trait JobQueue: Send + Sync {
    /// Append a job to the named queue. The job becomes claimable at its
    /// `available_at`.
    fn enqueue(
        &self,
        queue: &str,
        job: &QueueJob,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Claim the next available job from the named queue, if any.
    ///
    /// A claim takes a lease: the job stays invisible to other consumers
    /// until acknowledged or until the lease expires (at-least-once
    /// delivery).
    fn claim(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<Option<QueueJob>, QueueError>> + Send;

    /// Acknowledge a claimed job, removing it permanently.
    fn ack(
        &self,
        job_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Number of jobs currently in the named queue (claimed or not).
    fn depth(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<u64, QueueError>> + Send;
}
