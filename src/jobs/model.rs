//! Job types shared by the producer, the queue and the processor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Queue-assigned job identifier. Stable across retries of the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for JobId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Payload of a download job as enqueued by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPayload {
    pub file_ids: Vec<String>,
}

/// File ids extracted from a delivered payload, plus what had to be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPayload {
    pub file_ids: Vec<String>,
    /// Set when the payload was not a well-formed `{fileIds: [string]}`.
    pub malformed: Option<String>,
}

impl DownloadPayload {
    pub fn new<I, S>(file_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            file_ids: file_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Lenient parse of whatever the queue handed back.
    ///
    /// A missing or non-array `fileIds` yields no files; non-string entries are
    /// skipped. Neither is an error: the job simply processes fewer files.
    pub fn parse(data: &serde_json::Value) -> ParsedPayload {
        let Some(raw) = data.get("fileIds") else {
            return ParsedPayload {
                file_ids: Vec::new(),
                malformed: Some("payload has no fileIds".to_string()),
            };
        };
        let Some(items) = raw.as_array() else {
            return ParsedPayload {
                file_ids: Vec::new(),
                malformed: Some(format!("fileIds is not a list: {raw}")),
            };
        };

        let file_ids: Vec<String> = items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let skipped = items.len() - file_ids.len();
        ParsedPayload {
            file_ids,
            malformed: (skipped > 0).then(|| format!("skipped {skipped} non-string fileIds")),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "fileIds": self.file_ids })
    }
}

/// Retry delay policy, interpreted by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: u64 },
    /// `delay * 2^(retry - 1)`.
    Exponential { delay: u64 },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
            Backoff::Exponential { delay } => {
                let exp = retry.saturating_sub(1).min(32);
                Duration::from_millis(delay.saturating_mul(1u64 << exp))
            }
        }
    }
}

/// Enqueue options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total attempts allowed, including the first. Unset means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

impl JobOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Attempt ceiling; unset or zero means a single attempt.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }
}

/// A job as handed to a worker by the queue for one attempt.
#[derive(Debug, Clone)]
pub struct DeliveredJob {
    pub id: JobId,
    /// Raw payload; parsed leniently by the processor.
    pub data: serde_json::Value,
    /// Attempts made before this one.
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Token of the lease under which this delivery runs.
    pub lease_token: String,
}

impl DeliveredJob {
    /// Whether a failure of this attempt exhausts the job.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts_made + 1 >= self.max_attempts.max(1)
    }
}

/// Result handed back to the queue on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub processed_files: usize,
    pub processing_time_ms: u64,
}
