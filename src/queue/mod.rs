//! Durable job queue boundary.
//!
//! The queue owns job ids, attempt counting, leases and retry/backoff. Workers
//! only see deliveries and report back through [`JobQueue::ack`] and
//! [`JobQueue::fail`].

pub mod memory;
pub mod redis_queue;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::jobs::model::{DeliveredJob, JobId, JobOptions, JobOutcome};

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

/// What the queue did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Redelivered after `delay`.
    Retry { delay: Duration },
    /// Attempts exhausted; the job is abandoned as failed.
    Exhausted,
}

/// Where a job currently sits in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    Waiting,
    Delayed,
    Active,
    Completed(JobOutcome),
    Failed(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Accept a job. The payload is stored as-is.
    async fn enqueue(
        &self,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobId, QueueError>;

    /// Take the next ready job under a lease of `lease`, or `None` if idle.
    async fn dequeue(&self, lease: Duration) -> Result<Option<DeliveredJob>, QueueError>;

    /// Push the lease deadline of a running delivery out to `lease` from now.
    async fn extend_lease(&self, job: &DeliveredJob, lease: Duration) -> Result<(), QueueError>;

    /// Acknowledge success; the job will not run again.
    async fn ack(&self, job: &DeliveredJob, outcome: &JobOutcome) -> Result<(), QueueError>;

    /// Report failure; the queue decides between retry and abandonment.
    async fn fail(&self, job: &DeliveredJob, reason: &str) -> Result<FailDisposition, QueueError>;

    /// Current position of a job, `None` if unknown.
    async fn state(&self, job_id: &JobId) -> Result<Option<QueueState>, QueueError>;
}

/// Delay before redelivery, given the attempt count after the failed attempt
/// was recorded.
pub(crate) fn retry_delay(options: &JobOptions, attempts_made: u32) -> Duration {
    options
        .backoff
        .map(|b| b.delay_for_retry(attempts_made))
        .unwrap_or(Duration::ZERO)
}
