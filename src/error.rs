//! Error types for the download worker.

use crate::jobs::state::JobStatus;

/// Configuration-related errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the key-value status store or the artifact store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connectivity loss or timeout. Retried by the client before surfacing.
    #[error("{store} unavailable during {operation}: {reason}")]
    Unavailable {
        store: &'static str,
        operation: &'static str,
        reason: String,
    },

    /// The store answered but refused the request.
    #[error("{store} rejected {operation}: {reason}")]
    Rejected {
        store: &'static str,
        operation: &'static str,
        reason: String,
    },

    /// A stored record could not be decoded.
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Whether the client's bounded retry applies to this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors at the job queue boundary.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue command failed: {0}")]
    Command(String),

    #[error("Lease lost for job {job_id}")]
    LeaseLost { job_id: String },

    #[error("Job {job_id} not found")]
    NotFound { job_id: String },

    #[error("Corrupt job {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}

/// Failure raised by a unit of work.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),
}

impl WorkError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Why a job attempt failed. The message is what lands in the record's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error(transparent)]
    Work(#[from] WorkError),

    #[error("artifact write failed: {0}")]
    Artifact(#[source] StoreError),

    #[error("status write failed: {0}")]
    Status(#[source] StoreError),
}
