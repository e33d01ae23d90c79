//! Store traits: the key-value status store and the artifact (object) store.
//!
//! Both are external services consumed only through these primitives. Every
//! call is independent; nothing here spans both stores.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::jobs::model::JobId;
use crate::jobs::state::{StatusFields, StatusRecord};

/// Per-job status records with a time-to-live.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Merge `fields` into the job's record, creating it if absent.
    /// Fields not named here are left untouched.
    async fn set_status(&self, job_id: &JobId, fields: &StatusFields) -> Result<(), StoreError>;

    /// Expire the whole record `ttl` from now.
    async fn set_expiry(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError>;

    /// Drop any pending expiry so the record lives until the next terminal write.
    async fn clear_expiry(&self, job_id: &JobId) -> Result<(), StoreError>;

    /// Read the record. Observers only; the processor never reads.
    async fn get_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, StoreError>;
}

/// Outcome of a bucket creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketCreation {
    Created,
    /// Someone else (or an earlier run) got there first.
    AlreadyExists,
}

/// Durable storage for job result artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    /// Create a bucket. "Already exists" is reported, not raised.
    async fn create_bucket(&self, bucket: &str) -> Result<BucketCreation, StoreError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// Idempotent provisioning: check, then create only if absent. Safe to
    /// run concurrently; losing a creation race counts as success.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        if self.bucket_exists(bucket).await? {
            tracing::info!(bucket, "Bucket exists");
            return Ok(());
        }

        match self.create_bucket(bucket).await? {
            BucketCreation::Created => tracing::info!(bucket, "Bucket created"),
            BucketCreation::AlreadyExists => {
                tracing::debug!(bucket, "Bucket created concurrently by another caller")
            }
        }
        Ok(())
    }
}
