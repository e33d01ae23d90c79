//! Job status state machine and the status record persisted per job.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::jobs::model::JobId;

/// Field names of the status hash.
pub mod fields {
    pub const STATUS: &str = "status";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const PROCESSED_FILES: &str = "processedFiles";
    pub const BUCKET: &str = "bucket";
    pub const RESULT_KEY: &str = "resultKey";
    pub const ERROR: &str = "error";
}

/// Lifecycle status of a job as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// An attempt is running.
    Processing,
    /// Artifact written; terminal.
    Completed,
    /// Attempt failed, the queue will redeliver.
    Retrying,
    /// Last attempt failed; terminal.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another one.
    ///
    /// Terminal statuses only leave through a redelivery, which always
    /// restarts at `Processing`.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Processing, Completed) | (Processing, Retrying) | (Processing, Failed) |
            (Retrying, Processing) |
            (Completed, Processing) | (Failed, Processing)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "retrying" => Ok(Self::Retrying),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// Key of the status hash for a job.
pub fn status_key(job_id: &JobId) -> String {
    format!("job:{job_id}")
}

/// Object key of a job's result artifact. Retries of a job overwrite it.
pub fn result_key(job_id: &JobId) -> String {
    format!("results/job-{job_id}.txt")
}

/// Fields to merge into a status hash. String-valued, like the store.
pub type StatusFields = BTreeMap<String, String>;

/// One status transition, ready to be merged into the job's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub updated_at: i64,
    pub processed_files: Option<usize>,
    pub bucket: Option<String>,
    pub result_key: Option<String>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn processing(updated_at: i64) -> Self {
        Self::bare(JobStatus::Processing, updated_at)
    }

    pub fn completed(
        updated_at: i64,
        processed_files: usize,
        bucket: impl Into<String>,
        result_key: impl Into<String>,
    ) -> Self {
        Self {
            processed_files: Some(processed_files),
            bucket: Some(bucket.into()),
            result_key: Some(result_key.into()),
            ..Self::bare(JobStatus::Completed, updated_at)
        }
    }

    /// `Failed` on the last attempt, `Retrying` otherwise.
    pub fn failure(updated_at: i64, error: impl Into<String>, last_attempt: bool) -> Self {
        let status = if last_attempt {
            JobStatus::Failed
        } else {
            JobStatus::Retrying
        };
        Self {
            error: Some(error.into()),
            ..Self::bare(status, updated_at)
        }
    }

    fn bare(status: JobStatus, updated_at: i64) -> Self {
        Self {
            status,
            updated_at,
            processed_files: None,
            bucket: None,
            result_key: None,
            error: None,
        }
    }

    /// Only the fields this transition sets; everything else in the hash is left alone.
    pub fn to_fields(&self) -> StatusFields {
        let mut out = StatusFields::new();
        out.insert(fields::STATUS.into(), self.status.to_string());
        out.insert(fields::UPDATED_AT.into(), self.updated_at.to_string());
        if let Some(n) = self.processed_files {
            out.insert(fields::PROCESSED_FILES.into(), n.to_string());
        }
        if let Some(ref bucket) = self.bucket {
            out.insert(fields::BUCKET.into(), bucket.clone());
        }
        if let Some(ref key) = self.result_key {
            out.insert(fields::RESULT_KEY.into(), key.clone());
        }
        if let Some(ref error) = self.error {
            out.insert(fields::ERROR.into(), error.clone());
        }
        out
    }
}

/// A job's status record as read back by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status: JobStatus,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRecord {
    /// Decode a raw hash.
    ///
    /// Merged writes leave fields from earlier transitions in the hash, so
    /// only the fields that belong to the current status are read: artifact
    /// fields once `completed`, `error` only while `retrying` or `failed`.
    pub fn from_fields(key: &str, raw: &HashMap<String, String>) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.to_string(),
            reason,
        };

        let status = raw
            .get(fields::STATUS)
            .ok_or_else(|| corrupt("missing status".to_string()))?
            .parse::<JobStatus>()
            .map_err(corrupt)?;
        let updated_at = match raw.get(fields::UPDATED_AT) {
            Some(v) => v
                .parse()
                .map_err(|e| corrupt(format!("bad updatedAt {v:?}: {e}")))?,
            None => 0,
        };

        let mut record = Self {
            status,
            updated_at,
            processed_files: None,
            bucket: None,
            result_key: None,
            error: None,
        };
        match status {
            JobStatus::Completed => {
                record.processed_files = match raw.get(fields::PROCESSED_FILES) {
                    Some(v) => Some(
                        v.parse()
                            .map_err(|e| corrupt(format!("bad processedFiles {v:?}: {e}")))?,
                    ),
                    None => None,
                };
                record.bucket = raw.get(fields::BUCKET).cloned();
                record.result_key = raw.get(fields::RESULT_KEY).cloned();
            }
            JobStatus::Retrying | JobStatus::Failed => {
                record.error = raw.get(fields::ERROR).cloned();
            }
            JobStatus::Processing => {}
        }
        Ok(record)
    }
}

/// Hands out `updatedAt` stamps that never go backwards, even if the wall
/// clock does.
#[derive(Debug, Default)]
pub struct TransitionClock {
    last: i64,
}

impl TransitionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a stamp already stored for the job, so a worker whose
    /// clock lags the previous writer's never stamps an earlier time.
    pub fn resume(last: i64) -> Self {
        Self { last }
    }

    pub fn stamp(&mut self) -> i64 {
        self.last = self.last.max(Utc::now().timestamp_millis());
        self.last
    }
}
