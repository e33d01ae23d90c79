//! The unit of work a job runs. Replaceable without touching the lifecycle.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use rand::Rng;

use crate::config::SimulationConfig;
use crate::error::WorkError;
use crate::jobs::model::JobId;

/// Input to one execution.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub job_id: JobId,
    pub file_ids: Vec<String>,
}

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOutput {
    pub processed_files: usize,
    /// Artifact body to persist.
    pub body: Bytes,
    pub content_type: String,
}

#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn execute(&self, request: &WorkRequest) -> Result<WorkOutput, WorkError>;
}

/// Stand-in for a real download: waits a random time inside the configured
/// window and reports every file as processed.
#[derive(Debug, Clone)]
pub struct SimulatedDownload {
    config: SimulationConfig,
}

impl SimulatedDownload {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Uniform in `[min, max)`; exactly `min` when the window is empty.
    pub fn pick_delay(&self) -> Duration {
        let min = self.config.min_delay.as_millis() as u64;
        let max = self.config.max_delay.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}

#[async_trait]
impl UnitOfWork for SimulatedDownload {
    fn name(&self) -> &str {
        "simulated-download"
    }

    async fn execute(&self, request: &WorkRequest) -> Result<WorkOutput, WorkError> {
        let delay = self.pick_delay();
        tracing::debug!(
            job_id = %request.job_id,
            delay_ms = delay.as_millis() as u64,
            "Simulating download"
        );
        tokio::time::sleep(delay).await;

        let finished_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body = format!("Job {} completed at {}", request.job_id, finished_at);
        Ok(WorkOutput {
            processed_files: request.file_ids.len(),
            body: Bytes::from(body),
            content_type: "text/plain".to_string(),
        })
    }
}
