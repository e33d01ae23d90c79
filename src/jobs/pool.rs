//! Worker pool: pulls deliveries off the queue and runs them through the
//! processor, `concurrency` at a time.
//!
//! Each slot is an independent loop. While a job runs, the slot renews its
//! lease every half lock duration so a long job is not handed to another
//! worker. If the queue reports the lease as lost, the attempt is dropped on
//! the spot so it cannot write over the new holder's status. On shutdown,
//! in-flight jobs are dropped and left to lease expiry.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::{JobError, QueueError};
use crate::jobs::model::{DeliveredJob, JobOutcome};
use crate::jobs::processor::JobProcessor;
use crate::queue::{FailDisposition, JobQueue};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Jobs processed at the same time.
    pub concurrency: usize,
    /// Lease taken on each delivery and renewed while it runs.
    pub lock_duration: Duration,
    /// Idle wait between empty dequeues.
    pub poll_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration: Duration::from_millis(60_000),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            lock_duration: config.lock_duration,
            poll_interval: config.poll_interval,
        }
    }
}

impl PoolSettings {
    fn heartbeat_every(&self) -> Duration {
        (self.lock_duration / 2).max(Duration::from_millis(1))
    }
}

/// Runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Deliveries whose result the queue refused (lease lost or queue error).
    pub jobs_unreported: u64,
    /// Attempts dropped mid-run because the lease went to another worker.
    pub jobs_abandoned: u64,
    pub current_running: usize,
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    slots: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        lock_stats(&self.stats).clone()
    }

    /// Stop taking work and wait for every slot to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for slot in self.slots {
            if let Err(e) = slot.await {
                tracing::error!("Worker slot panicked: {}", e);
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

struct Shared {
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    settings: PoolSettings,
    stats: Arc<Mutex<PoolStats>>,
}

/// Why an attempt stopped before the processor returned.
enum Interrupted {
    Shutdown,
    LeaseLost,
}

fn lock_stats(stats: &Mutex<PoolStats>) -> std::sync::MutexGuard<'_, PoolStats> {
    stats.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<JobProcessor>, settings: PoolSettings) -> Self {
        Self {
            queue,
            processor,
            settings,
        }
    }

    /// Start the slots on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let concurrency = self.settings.concurrency.max(1);

        tracing::info!(
            concurrency,
            lock_ms = self.settings.lock_duration.as_millis() as u64,
            "Worker pool started"
        );

        let shared = Arc::new(Shared {
            queue: self.queue,
            processor: self.processor,
            settings: self.settings,
            stats: stats.clone(),
        });
        let slots = (0..concurrency)
            .map(|slot| tokio::spawn(run_slot(slot, shared.clone(), shutdown_rx.clone())))
            .collect();

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            slots,
            stats,
        }
    }
}

async fn run_slot(slot: usize, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = match shared.queue.dequeue(shared.settings.lock_duration).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                if idle(&shared.settings, &mut shutdown).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(slot, "Dequeue failed: {}", e);
                if idle(&shared.settings, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        if !shared.run_job(slot, job, &mut shutdown).await {
            break;
        }
    }
    tracing::debug!(slot, "Worker slot exited");
}

/// Wait one poll interval. Returns `true` if shutdown was requested meanwhile.
async fn idle(settings: &PoolSettings, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(settings.poll_interval) => false,
        _ = shutdown.changed() => true,
    }
}

impl Shared {
    /// Run one delivery to completion and report it. Returns `false` if the
    /// slot should stop.
    async fn run_job(
        &self,
        slot: usize,
        job: DeliveredJob,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        {
            let mut stats = lock_stats(&self.stats);
            stats.jobs_started += 1;
            stats.current_running += 1;
        }
        let started = Instant::now();

        let result = self.run_with_heartbeat(&job, shutdown).await;
        lock_stats(&self.stats).current_running -= 1;

        let result = match result {
            Ok(result) => result,
            Err(Interrupted::Shutdown) => {
                tracing::info!(slot, job_id = %job.id, "Shutting down, job left for redelivery");
                return false;
            }
            Err(Interrupted::LeaseLost) => {
                lock_stats(&self.stats).jobs_abandoned += 1;
                tracing::warn!(slot, job_id = %job.id, "Lease lost mid-attempt, job abandoned");
                return true;
            }
        };

        match result {
            Ok(outcome) => match self.queue.ack(&job, &outcome).await {
                Ok(()) => {
                    lock_stats(&self.stats).jobs_succeeded += 1;
                    tracing::debug!(
                        slot,
                        job_id = %job.id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Job acknowledged"
                    );
                }
                Err(e) => self.unreported(&job, e),
            },
            Err(err) => self.report_failure(&job, &err).await,
        }
        true
    }

    /// Dropping `process` on an interruption stops every later status or
    /// artifact write of the attempt.
    async fn run_with_heartbeat(
        &self,
        job: &DeliveredJob,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Result<JobOutcome, JobError>, Interrupted> {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_every());
        // First tick fires immediately; the lease was just taken.
        heartbeat.tick().await;

        let process = self.processor.process(job);
        tokio::pin!(process);

        loop {
            tokio::select! {
                result = &mut process => return Ok(result),
                _ = heartbeat.tick() => {
                    match self.queue.extend_lease(job, self.settings.lock_duration).await {
                        Ok(()) => {}
                        Err(QueueError::LeaseLost { .. }) => return Err(Interrupted::LeaseLost),
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, "Could not extend lease: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => return Err(Interrupted::Shutdown),
            }
        }
    }

    async fn report_failure(&self, job: &DeliveredJob, err: &JobError) {
        match self.queue.fail(job, &err.to_string()).await {
            Ok(FailDisposition::Retry { delay }) => {
                lock_stats(&self.stats).jobs_retried += 1;
                tracing::info!(
                    job_id = %job.id,
                    delay_ms = delay.as_millis() as u64,
                    "Job scheduled for retry"
                );
            }
            Ok(FailDisposition::Exhausted) => {
                lock_stats(&self.stats).jobs_failed += 1;
                tracing::error!(job_id = %job.id, "Job exhausted its attempts");
            }
            Err(e) => self.unreported(job, e),
        }
    }

    fn unreported(&self, job: &DeliveredJob, err: QueueError) {
        lock_stats(&self.stats).jobs_unreported += 1;
        match err {
            QueueError::LeaseLost { .. } => {
                tracing::warn!(job_id = %job.id, "Lease lost before result was reported");
            }
            other => {
                tracing::error!(job_id = %job.id, "Could not report job result: {}", other);
            }
        }
    }
}
