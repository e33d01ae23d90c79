//! In-memory queue with the same lease and retry semantics as the Redis one.
//!
//! Finished jobs are never pruned: every job ever enqueued stays in the map
//! so tests can inspect its final state. Memory grows with the number of
//! jobs, so this queue is not meant for long-running processes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{FailDisposition, JobQueue, QueueState, retry_delay};
use crate::error::QueueError;
use crate::jobs::model::{DeliveredJob, JobId, JobOptions, JobOutcome};

#[derive(Debug, Clone)]
enum Slot {
    Waiting,
    Delayed { ready_at: Instant },
    Active { token: String, deadline: Instant },
    Completed(JobOutcome),
    Failed(String),
}

#[derive(Debug, Clone)]
struct StoredJob {
    data: serde_json::Value,
    options: JobOptions,
    attempts_made: u32,
    slot: Slot,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    jobs: HashMap<JobId, StoredJob>,
    wait: VecDeque<JobId>,
}

impl Inner {
    /// Move due delayed jobs and expired leases back onto the wait list.
    fn requeue_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, JobId)> = Vec::new();
        let mut stalled: Vec<JobId> = Vec::new();
        for (id, job) in &self.jobs {
            match job.slot {
                Slot::Delayed { ready_at } if ready_at <= now => due.push((ready_at, id.clone())),
                Slot::Active { deadline, .. } if deadline <= now => stalled.push(id.clone()),
                _ => {}
            }
        }

        due.sort();
        for (_, id) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.slot = Slot::Waiting;
                self.wait.push_back(id);
            }
        }

        stalled.sort();
        for id in stalled.into_iter().rev() {
            if let Some(job) = self.jobs.get_mut(&id) {
                tracing::warn!(job_id = %id, "Lease expired, job returned to queue");
                job.slot = Slot::Waiting;
                self.wait.push_front(id);
            }
        }
    }

    fn leased_mut(&mut self, job: &DeliveredJob) -> Result<&mut StoredJob, QueueError> {
        let stored = self.jobs.get_mut(&job.id).ok_or_else(|| QueueError::NotFound {
            job_id: job.id.to_string(),
        })?;
        match &stored.slot {
            Slot::Active { token, .. } if *token == job.lease_token => Ok(stored),
            _ => Err(QueueError::LeaseLost {
                job_id: job.id.to_string(),
            }),
        }
    }
}

/// Process-local queue. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attempts made so far for a job.
    pub fn attempts_made(&self, job_id: &JobId) -> Option<u32> {
        self.lock().jobs.get(job_id).map(|j| j.attempts_made)
    }

    /// Jobs waiting or delayed.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|j| matches!(j.slot, Slot::Waiting | Slot::Delayed { .. }))
            .count()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobId, QueueError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = JobId::from(inner.next_id);
        inner.jobs.insert(
            id.clone(),
            StoredJob {
                data,
                options: options.clone(),
                attempts_made: 0,
                slot: Slot::Waiting,
            },
        );
        inner.wait.push_back(id.clone());
        Ok(id)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<DeliveredJob>, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.requeue_due(now);

        while let Some(id) = inner.wait.pop_front() {
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if !matches!(job.slot, Slot::Waiting) {
                continue;
            }
            let token = Uuid::new_v4().to_string();
            job.slot = Slot::Active {
                token: token.clone(),
                deadline: now + lease,
            };
            return Ok(Some(DeliveredJob {
                id,
                data: job.data.clone(),
                attempts_made: job.attempts_made,
                max_attempts: job.options.max_attempts(),
                lease_token: token,
            }));
        }
        Ok(None)
    }

    async fn extend_lease(&self, job: &DeliveredJob, lease: Duration) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let stored = inner.leased_mut(job)?;
        stored.slot = Slot::Active {
            token: job.lease_token.clone(),
            deadline: Instant::now() + lease,
        };
        Ok(())
    }

    async fn ack(&self, job: &DeliveredJob, outcome: &JobOutcome) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let stored = inner.leased_mut(job)?;
        stored.slot = Slot::Completed(*outcome);
        Ok(())
    }

    async fn fail(&self, job: &DeliveredJob, reason: &str) -> Result<FailDisposition, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let stored = inner.leased_mut(job)?;
        stored.attempts_made += 1;

        if stored.attempts_made >= stored.options.max_attempts() {
            stored.slot = Slot::Failed(reason.to_string());
            return Ok(FailDisposition::Exhausted);
        }

        let delay = retry_delay(&stored.options, stored.attempts_made);
        if delay.is_zero() {
            stored.slot = Slot::Waiting;
            inner.wait.push_back(job.id.clone());
        } else {
            stored.slot = Slot::Delayed {
                ready_at: now + delay,
            };
        }
        Ok(FailDisposition::Retry { delay })
    }

    async fn state(&self, job_id: &JobId) -> Result<Option<QueueState>, QueueError> {
        Ok(self.lock().jobs.get(job_id).map(|job| match &job.slot {
            Slot::Waiting => QueueState::Waiting,
            Slot::Delayed { .. } => QueueState::Delayed,
            Slot::Active { .. } => QueueState::Active,
            Slot::Completed(outcome) => QueueState::Completed(*outcome),
            Slot::Failed(reason) => QueueState::Failed(reason.clone()),
        }))
    }
}
