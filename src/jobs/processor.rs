//! Drives one attempt of a job through its lifecycle.
//!
//! ```text
//! dequeue ─► processing ─► work ─► put artifact ─► completed ─► expire
//!                           │           │              │
//!                           └───────────┴──────────────┴─► retrying | failed (+ expire)
//! ```
//!
//! The artifact is always written before the `completed` status, so an
//! observer that sees `completed` can fetch the artifact. A crash between the
//! two leaves an artifact without a completed record; the retry overwrites it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::JobError;
use crate::jobs::model::{DeliveredJob, DownloadPayload, JobOutcome};
use crate::jobs::state::{JobStatus, StatusUpdate, TransitionClock, result_key};
use crate::jobs::work::{UnitOfWork, WorkRequest};
use crate::store::{ArtifactStore, StatusStore};

/// Where results go and how long terminal records live.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub bucket: String,
    pub status_retention: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            bucket: "download-results".to_string(),
            status_retention: Duration::from_secs(86_400),
        }
    }
}

impl From<&PoolConfig> for ProcessorSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            status_retention: config.status_retention,
        }
    }
}

/// Collaborators injected into the processor.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub status: Arc<dyn StatusStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub work: Arc<dyn UnitOfWork>,
}

/// Status of the attempt in flight, checked before every status write.
///
/// Starts at `Processing` even if that write failed: the attempt itself is
/// running, whatever an earlier attempt left in the store.
#[derive(Debug)]
struct AttemptStatus(JobStatus);

impl AttemptStatus {
    fn started() -> Self {
        Self(JobStatus::Processing)
    }

    fn check(&self, next: JobStatus) -> Result<(), JobError> {
        if self.0.can_transition_to(next) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                from: self.0,
                to: next,
            })
        }
    }

    fn commit(&mut self, next: JobStatus) {
        self.0 = next;
    }
}

/// Runs job attempts. Holds no per-job state between calls.
pub struct JobProcessor {
    deps: ProcessorDeps,
    settings: ProcessorSettings,
}

impl JobProcessor {
    pub fn new(deps: ProcessorDeps, settings: ProcessorSettings) -> Self {
        Self { deps, settings }
    }

    /// Run one attempt of `job`.
    ///
    /// `Ok` means the queue should acknowledge; `Err` must go back to the
    /// queue so its retry policy decides what happens next. The status record
    /// already reflects the outcome either way.
    pub async fn process(&self, job: &DeliveredJob) -> Result<JobOutcome, JobError> {
        let mut clock = self.resume_clock(job).await;
        let parsed = DownloadPayload::parse(&job.data);
        if let Some(ref problem) = parsed.malformed {
            tracing::warn!(job_id = %job.id, "Malformed payload, continuing: {}", problem);
        }

        tracing::info!(
            job_id = %job.id,
            work = self.deps.work.name(),
            attempt = job.attempts_made + 1,
            max_attempts = job.max_attempts,
            files = %parsed.file_ids.join(", "),
            "Started job"
        );

        self.mark_processing(job, clock.stamp()).await;
        let mut attempt = AttemptStatus::started();

        let request = WorkRequest {
            job_id: job.id.clone(),
            file_ids: parsed.file_ids,
        };
        match self.run_attempt(&request, &mut clock, &mut attempt).await {
            Ok(outcome) => {
                tracing::info!(
                    job_id = %job.id,
                    processed_files = outcome.processed_files,
                    "Finished job after {:.1}s",
                    outcome.processing_time_ms as f64 / 1000.0
                );
                Ok(outcome)
            }
            Err(err) => {
                self.record_failure(job, &err, clock.stamp(), &attempt).await;
                Err(err)
            }
        }
    }

    /// Seed stamps from the record an earlier attempt left, if any.
    async fn resume_clock(&self, job: &DeliveredJob) -> TransitionClock {
        match self.deps.status.get_status(&job.id).await {
            Ok(Some(record)) => TransitionClock::resume(record.updated_at),
            Ok(None) => TransitionClock::new(),
            Err(e) => {
                tracing::warn!(job_id = %job.id, "Could not read previous status, stamping from local clock: {}", e);
                TransitionClock::new()
            }
        }
    }

    /// First write of an attempt. Unconditional: a redelivery overwrites
    /// whatever terminal status an earlier attempt left behind.
    async fn mark_processing(&self, job: &DeliveredJob, now: i64) {
        let status = &self.deps.status;
        if let Err(e) = status
            .set_status(&job.id, &StatusUpdate::processing(now).to_fields())
            .await
        {
            // Observers only; the attempt goes ahead.
            tracing::warn!(job_id = %job.id, "Could not record processing status: {}", e);
            return;
        }
        if let Err(e) = status.clear_expiry(&job.id).await {
            tracing::warn!(job_id = %job.id, "Could not clear carried-over expiry: {}", e);
        }
    }

    async fn run_attempt(
        &self,
        request: &WorkRequest,
        clock: &mut TransitionClock,
        attempt: &mut AttemptStatus,
    ) -> Result<JobOutcome, JobError> {
        let started = Instant::now();
        let output = self.deps.work.execute(request).await?;
        let processing_time_ms = started.elapsed().as_millis() as u64;

        let bucket = &self.settings.bucket;
        let key = result_key(&request.job_id);
        self.deps
            .artifacts
            .put_object(bucket, &key, output.body, &output.content_type)
            .await
            .map_err(JobError::Artifact)?;

        let completed = StatusUpdate::completed(clock.stamp(), output.processed_files, bucket, &key);
        attempt.check(completed.status)?;
        self.deps
            .status
            .set_status(&request.job_id, &completed.to_fields())
            .await
            .map_err(JobError::Status)?;
        self.deps
            .status
            .set_expiry(&request.job_id, self.settings.status_retention)
            .await
            .map_err(JobError::Status)?;
        // Only now is the attempt terminal; a failed expiry still goes down
        // the failure path from `processing`.
        attempt.commit(completed.status);

        Ok(JobOutcome {
            processed_files: output.processed_files,
            processing_time_ms,
        })
    }

    /// Failure transition. Only the last attempt gets the retention expiry; a
    /// `retrying` record has to outlive the backoff until the next delivery.
    async fn record_failure(
        &self,
        job: &DeliveredJob,
        err: &JobError,
        now: i64,
        attempt: &AttemptStatus,
    ) {
        let last_attempt = job.is_last_attempt();
        let update = StatusUpdate::failure(now, err.to_string(), last_attempt);
        if let Err(refused) = attempt.check(update.status) {
            tracing::error!(job_id = %job.id, "Not recording failure: {}", refused);
            return;
        }

        if last_attempt {
            tracing::error!(job_id = %job.id, attempts = job.attempts_made + 1, "Job failed: {}", err);
        } else {
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempts_made + 1,
                max_attempts = job.max_attempts,
                "Job attempt failed, will retry: {}",
                err
            );
        }

        if let Err(e) = self.deps.status.set_status(&job.id, &update.to_fields()).await {
            tracing::error!(job_id = %job.id, status = %update.status, "Could not record failure status: {}", e);
            return;
        }
        if !last_attempt {
            return;
        }
        if let Err(e) = self
            .deps
            .status
            .set_expiry(&job.id, self.settings.status_retention)
            .await
        {
            tracing::error!(job_id = %job.id, "Could not set expiry on failed job: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::WorkError;
    use crate::jobs::model::JobId;
    use crate::jobs::state::JobStatus;
    use crate::jobs::work::WorkOutput;
    use crate::store::{MemoryArtifactStore, MemoryStatusStore};

    /// Work that always fails with a fixed message.
    struct FailingWork(&'static str);

    #[async_trait]
    impl UnitOfWork for FailingWork {
        fn name(&self) -> &str {
            "failing"
        }
        async fn execute(&self, _request: &WorkRequest) -> Result<WorkOutput, WorkError> {
            Err(WorkError::failed(self.0))
        }
    }

    /// Work that succeeds immediately with a fixed body.
    struct InstantWork;

    #[async_trait]
    impl UnitOfWork for InstantWork {
        fn name(&self) -> &str {
            "instant"
        }
        async fn execute(&self, request: &WorkRequest) -> Result<WorkOutput, WorkError> {
            Ok(WorkOutput {
                processed_files: request.file_ids.len(),
                body: bytes::Bytes::from(format!("done {}", request.job_id)),
                content_type: "text/plain".to_string(),
            })
        }
    }

    async fn processor(
        work: Arc<dyn UnitOfWork>,
    ) -> (JobProcessor, Arc<MemoryStatusStore>, Arc<MemoryArtifactStore>) {
        let status = Arc::new(MemoryStatusStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        artifacts.ensure_bucket("download-results").await.unwrap();
        let deps = ProcessorDeps {
            status: status.clone(),
            artifacts: artifacts.clone(),
            work,
        };
        (
            JobProcessor::new(deps, ProcessorSettings::default()),
            status,
            artifacts,
        )
    }

    fn job(data: serde_json::Value, attempts_made: u32, max_attempts: u32) -> DeliveredJob {
        DeliveredJob {
            id: JobId::new("5"),
            data,
            attempts_made,
            max_attempts,
            lease_token: "token".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_writes_artifact_then_completed() {
        let (processor, status, artifacts) = processor(Arc::new(InstantWork)).await;
        let job = job(json!({"fileIds": ["a", "b"]}), 0, 1);

        let outcome = processor.process(&job).await.unwrap();
        assert_eq!(outcome.processed_files, 2);

        let object = artifacts.object("download-results", "results/job-5.txt").unwrap();
        assert_eq!(object.body, bytes::Bytes::from("done 5"));

        let record = status.get_status(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result_key.as_deref(), Some("results/job-5.txt"));
        assert_eq!(status.ttl(&job.id), Some(Duration::from_secs(86_400)));
        assert_eq!(
            status.transitions(&job.id),
            vec![JobStatus::Processing, JobStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_before_last_attempt_is_retrying_without_expiry() {
        let (processor, status, _) = processor(Arc::new(FailingWork("disk full"))).await;
        let job = job(json!({"fileIds": ["a"]}), 0, 3);

        let err = processor.process(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Work(_)));

        let record = status.get_status(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Retrying);
        assert_eq!(record.error.as_deref(), Some("disk full"));
        assert_eq!(status.ttl(&job.id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_on_last_attempt_is_failed_with_expiry() {
        let (processor, status, _) = processor(Arc::new(FailingWork("disk full"))).await;
        let job = job(json!({"fileIds": ["a"]}), 2, 3);

        processor.process(&job).await.unwrap_err();
        let record = status.get_status(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(status.ttl(&job.id), Some(Duration::from_secs(86_400)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_bucket_fails_the_attempt() {
        let status = Arc::new(MemoryStatusStore::new());
        let deps = ProcessorDeps {
            status: status.clone(),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            work: Arc::new(InstantWork),
        };
        let processor = JobProcessor::new(deps, ProcessorSettings::default());
        let job = job(json!({"fileIds": ["a"]}), 0, 1);

        let err = processor.process(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Artifact(_)));
        let record = status.get_status(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().starts_with("artifact write failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn stamps_never_precede_previous_attempt() {
        let (processor, status, _) = processor(Arc::new(InstantWork)).await;
        let job = job(json!({"fileIds": ["a"]}), 1, 2);
        // Written by a worker whose clock runs an hour ahead.
        let ahead = chrono::Utc::now().timestamp_millis() + 3_600_000;
        status
            .set_status(&job.id, &StatusUpdate::failure(ahead, "boom", false).to_fields())
            .await
            .unwrap();

        processor.process(&job).await.unwrap();
        let raw = status.raw(&job.id).unwrap();
        assert_eq!(raw["updatedAt"], ahead.to_string());
        let record = status.get_status(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.updated_at >= ahead);
    }

    #[test]
    fn attempt_status_follows_transition_table() {
        let mut attempt = AttemptStatus::started();
        assert!(attempt.check(JobStatus::Processing).is_err());
        assert!(attempt.check(JobStatus::Retrying).is_ok());
        assert!(attempt.check(JobStatus::Completed).is_ok());

        attempt.commit(JobStatus::Completed);
        let err = attempt.check(JobStatus::Failed).unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Failed
            }
        ));
        assert!(attempt.check(JobStatus::Retrying).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_completes_with_zero_files() {
        let (processor, status, _) = processor(Arc::new(InstantWork)).await;
        let job = job(json!({"fileIds": "not-a-list"}), 0, 1);

        let outcome = processor.process(&job).await.unwrap();
        assert_eq!(outcome.processed_files, 0);
        let record = status.get_status(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.processed_files, Some(0));
    }
}
