//! In-memory status and artifact stores, for tests and local runs.
//!
//! Semantics follow the real services: hash fields merge, expiry is lazy and
//! survives merges, writes to a missing bucket are rejected.
//!
//! Expired entries are dropped lazily on access, but the per-job transition
//! history is kept for the life of the store and never pruned.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::traits::{ArtifactStore, BucketCreation, StatusStore};
use crate::error::StoreError;
use crate::jobs::model::JobId;
use crate::jobs::state::{JobStatus, StatusFields, StatusRecord, fields, status_key};

#[derive(Debug, Clone)]
struct Entry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Status store backed by a map, with per-job transition history.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, Entry>>,
    history: Mutex<HashMap<String, Vec<JobStatus>>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if records.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            records.remove(key);
        }
        f(records.get_mut(key))
    }

    /// Raw hash of a live record.
    pub fn raw(&self, job_id: &JobId) -> Option<HashMap<String, String>> {
        self.live(&status_key(job_id), |e| e.map(|e| e.fields.clone()))
    }

    /// Remaining time-to-live; `None` if the record is absent or never expires.
    pub fn ttl(&self, job_id: &JobId) -> Option<Duration> {
        self.live(&status_key(job_id), |e| {
            e.and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        })
    }

    /// Every status value written for the job, in order.
    pub fn transitions(&self, job_id: &JobId) -> Vec<JobStatus> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&status_key(job_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn set_status(&self, job_id: &JobId, update: &StatusFields) -> Result<(), StoreError> {
        let key = status_key(job_id);
        {
            let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
            if records.get(&key).is_some_and(|e| e.is_expired(Instant::now())) {
                records.remove(&key);
            }
            let entry = records.entry(key.clone()).or_insert_with(|| Entry {
                fields: HashMap::new(),
                expires_at: None,
            });
            for (k, v) in update {
                entry.fields.insert(k.clone(), v.clone());
            }
        }

        if let Some(status) = update.get(fields::STATUS).and_then(|s| s.parse().ok()) {
            self.history
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .entry(key)
                .or_default()
                .push(status);
        }
        Ok(())
    }

    async fn set_expiry(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError> {
        self.live(&status_key(job_id), |e| {
            if let Some(entry) = e {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn clear_expiry(&self, job_id: &JobId) -> Result<(), StoreError> {
        self.live(&status_key(job_id), |e| {
            if let Some(entry) = e {
                entry.expires_at = None;
            }
        });
        Ok(())
    }

    async fn get_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, StoreError> {
        let key = status_key(job_id);
        match self.raw(job_id) {
            Some(raw) => StatusRecord::from_fields(&key, &raw).map(Some),
            None => Ok(None),
        }
    }
}

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
}

/// Artifact store backed by nested maps.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    buckets: Mutex<HashMap<String, HashMap<String, StoredObject>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.buckets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(bucket)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self
            .buckets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<BucketCreation, StoreError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        if buckets.contains_key(bucket) {
            return Ok(BucketCreation::AlreadyExists);
        }
        buckets.insert(bucket.to_string(), HashMap::new());
        Ok(BucketCreation::Created)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let objects = buckets.get_mut(bucket).ok_or_else(|| StoreError::Rejected {
            store: "object store",
            operation: "put_object",
            reason: format!("NoSuchBucket: {bucket}"),
        })?;
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::state::StatusUpdate;

    #[tokio::test]
    async fn set_status_merges_fields() {
        let store = MemoryStatusStore::new();
        let id = JobId::new("1");
        store
            .set_status(&id, &StatusUpdate::failure(1, "boom", false).to_fields())
            .await
            .unwrap();
        store
            .set_status(&id, &StatusUpdate::processing(2).to_fields())
            .await
            .unwrap();

        let raw = store.raw(&id).unwrap();
        assert_eq!(raw["status"], "processing");
        assert_eq!(raw["updatedAt"], "2");
        // Not named by the second write, so still there.
        assert_eq!(raw["error"], "boom");
        assert_eq!(
            store.transitions(&id),
            vec![JobStatus::Retrying, JobStatus::Processing]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_removes_record_lazily() {
        let store = MemoryStatusStore::new();
        let id = JobId::new("1");
        store
            .set_status(&id, &StatusUpdate::processing(1).to_fields())
            .await
            .unwrap();
        store.set_expiry(&id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.ttl(&id), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get_status(&id).await.unwrap().is_none());
        assert!(store.is_empty());
        // History outlives the record.
        assert_eq!(store.transitions(&id), vec![JobStatus::Processing]);
    }

    #[tokio::test]
    async fn clear_expiry_keeps_record() {
        let store = MemoryStatusStore::new();
        let id = JobId::new("1");
        store
            .set_status(&id, &StatusUpdate::processing(1).to_fields())
            .await
            .unwrap();
        store.set_expiry(&id, Duration::from_secs(10)).await.unwrap();
        store.clear_expiry(&id).await.unwrap();
        assert_eq!(store.ttl(&id), None);
        assert!(store.raw(&id).is_some());
    }

    #[tokio::test]
    async fn expiry_on_missing_record_is_noop() {
        let store = MemoryStatusStore::new();
        let id = JobId::new("missing");
        store.set_expiry(&id, Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn put_requires_bucket() {
        let store = MemoryArtifactStore::new();
        let err = store
            .put_object("nope", "k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
    }

    #[tokio::test]
    async fn ensure_bucket_is_idempotent() {
        let store = MemoryArtifactStore::new();
        store.ensure_bucket("b").await.unwrap();
        store.ensure_bucket("b").await.unwrap();
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(store.create_bucket("b").await.unwrap(), BucketCreation::AlreadyExists);
    }

    #[tokio::test]
    async fn put_overwrites_same_key() {
        let store = MemoryArtifactStore::new();
        store.ensure_bucket("b").await.unwrap();
        store
            .put_object("b", "k", Bytes::from_static(b"one"), "text/plain")
            .await
            .unwrap();
        store
            .put_object("b", "k", Bytes::from_static(b"two"), "text/plain")
            .await
            .unwrap();
        assert_eq!(store.object_count("b"), 1);
        assert_eq!(store.object("b", "k").unwrap().body, Bytes::from_static(b"two"));
    }
}
