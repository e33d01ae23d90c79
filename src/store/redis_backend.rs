//! Redis-backed status store.
//!
//! One hash per job under `job:<id>`. Merge is `HSET`, expiry is `EXPIRE`,
//! clearing it is `PERSIST`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::retry::RetryPolicy;
use super::traits::StatusStore;
use crate::error::StoreError;
use crate::jobs::model::JobId;
use crate::jobs::state::{StatusFields, StatusRecord, status_key};

const STORE: &str = "redis";

/// Classify a Redis error: connectivity problems are transient, the rest are not.
pub(crate) fn map_redis_error(operation: &'static str, e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Unavailable {
            store: STORE,
            operation,
            reason: e.to_string(),
        }
    } else {
        StoreError::Rejected {
            store: STORE,
            operation,
            reason: e.to_string(),
        }
    }
}

/// Open a managed (auto-reconnecting) connection.
pub async fn connect(url: &str) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(url).map_err(|e| map_redis_error("connect", e))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| map_redis_error("connect", e))
}

/// Status store over a shared Redis connection.
#[derive(Clone)]
pub struct RedisStatusStore {
    conn: ConnectionManager,
    retry: RetryPolicy,
}

impl RedisStatusStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn set_status(&self, job_id: &JobId, fields: &StatusFields) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let key = status_key(job_id);
        self.retry
            .run("set_status", || {
                let mut conn = self.conn.clone();
                let mut cmd = redis::cmd("HSET");
                cmd.arg(&key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
                async move {
                    let _: i64 = cmd
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| map_redis_error("set_status", e))?;
                    Ok(())
                }
            })
            .await
    }

    async fn set_expiry(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError> {
        let key = status_key(job_id);
        let secs = ttl.as_secs().max(1);
        self.retry
            .run("set_expiry", || {
                let mut conn = self.conn.clone();
                let mut cmd = redis::cmd("EXPIRE");
                cmd.arg(&key).arg(secs);
                async move {
                    let _: i64 = cmd
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| map_redis_error("set_expiry", e))?;
                    Ok(())
                }
            })
            .await
    }

    async fn clear_expiry(&self, job_id: &JobId) -> Result<(), StoreError> {
        let key = status_key(job_id);
        self.retry
            .run("clear_expiry", || {
                let mut conn = self.conn.clone();
                let mut cmd = redis::cmd("PERSIST");
                cmd.arg(&key);
                async move {
                    let _: i64 = cmd
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| map_redis_error("clear_expiry", e))?;
                    Ok(())
                }
            })
            .await
    }

    async fn get_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, StoreError> {
        let key = status_key(job_id);
        let raw: HashMap<String, String> = self
            .retry
            .run("get_status", || {
                let mut conn = self.conn.clone();
                let mut cmd = redis::cmd("HGETALL");
                cmd.arg(&key);
                async move {
                    cmd.query_async(&mut conn)
                        .await
                        .map_err(|e| map_redis_error("get_status", e))
                }
            })
            .await?;

        if raw.is_empty() {
            return Ok(None);
        }
        StatusRecord::from_fields(&key, &raw).map(Some)
    }
}
