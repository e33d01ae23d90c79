//! Redis-backed queue.
//!
//! Layout under `dq:<queue>`:
//! - `:id`: job id counter
//! - `:job:<id>`: job hash (`data`, `attempts`, `attemptsMade`, `backoffType`,
//!   `backoffDelay`, `lockToken`, `returnvalue`, `failedReason`, `finishedOn`)
//! - `:wait` / `:active`: lists; new jobs are pushed left and popped right
//! - `:leases`: zset of active ids scored by lease deadline (ms)
//! - `:delayed`: zset of ids scored by ready time (ms)
//! - `:completed` / `:failed`: zsets scored by finish time (ms)
//!
//! Every state change is one Lua script so it is atomic on the server.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::{FailDisposition, JobQueue, QueueState};
use crate::error::QueueError;
use crate::jobs::model::{Backoff, DeliveredJob, JobId, JobOptions, JobOutcome};

static ENQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local id = redis.call('INCR', KEYS[1])
local jobKey = ARGV[1] .. ':job:' .. id
redis.call('HSET', jobKey, 'data', ARGV[2], 'attempts', ARGV[3], 'attemptsMade', 0,
  'backoffType', ARGV[4], 'backoffDelay', ARGV[5], 'timestamp', ARGV[6])
redis.call('LPUSH', KEYS[2], id)
return id
"#,
    )
});

static DEQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local now = tonumber(ARGV[2])
local due = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[4], id)
  redis.call('LPUSH', KEYS[1], id)
end
local stalled = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('LREM', KEYS[2], 1, id)
  redis.call('HDEL', ARGV[1] .. ':job:' .. id, 'lockToken')
  redis.call('RPUSH', KEYS[1], id)
end
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not id then return false end
local jobKey = ARGV[1] .. ':job:' .. id
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), id)
redis.call('HSET', jobKey, 'lockToken', ARGV[4], 'processedOn', now)
local f = redis.call('HMGET', jobKey, 'data', 'attemptsMade', 'attempts')
return {id, f[1], f[2], f[3], #stalled}
"#,
    )
});

static EXTEND: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('HGET', ARGV[1], 'lockToken') ~= ARGV[2] then return 0 end
redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[4])
return 1
"#,
    )
});

static COMPLETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('HGET', ARGV[1], 'lockToken') ~= ARGV[2] then return 0 end
redis.call('LREM', KEYS[1], 1, ARGV[3])
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('HDEL', ARGV[1], 'lockToken')
redis.call('HSET', ARGV[1], 'returnvalue', ARGV[4], 'finishedOn', ARGV[5])
redis.call('ZADD', KEYS[3], ARGV[5], ARGV[3])
return 1
"#,
    )
});

/// Returns -1 on a lost lease, -2 when attempts are exhausted, otherwise the
/// retry delay in ms.
static FAIL: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('HGET', ARGV[1], 'lockToken') ~= ARGV[2] then return -1 end
redis.call('LREM', KEYS[1], 1, ARGV[3])
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('HDEL', ARGV[1], 'lockToken')
redis.call('HSET', ARGV[1], 'failedReason', ARGV[4])
local made = redis.call('HINCRBY', ARGV[1], 'attemptsMade', 1)
local max = tonumber(redis.call('HGET', ARGV[1], 'attempts') or '1')
local now = tonumber(ARGV[5])
if made >= max then
  redis.call('HSET', ARGV[1], 'finishedOn', now)
  redis.call('ZADD', KEYS[5], now, ARGV[3])
  return -2
end
local kind = redis.call('HGET', ARGV[1], 'backoffType') or ''
local delay = tonumber(redis.call('HGET', ARGV[1], 'backoffDelay') or '0') or 0
if kind == 'exponential' then
  delay = delay * (2 ^ (made - 1))
elseif kind ~= 'fixed' then
  delay = 0
end
if delay > 0 then
  redis.call('ZADD', KEYS[4], now + delay, ARGV[3])
else
  redis.call('LPUSH', KEYS[3], ARGV[3])
end
return delay
"#,
    )
});

static STATE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', ARGV[1]) == 0 then return false end
local rv = redis.call('HGET', ARGV[1], 'returnvalue')
if rv then return {'completed', rv} end
if redis.call('HEXISTS', ARGV[1], 'finishedOn') == 1 then
  return {'failed', redis.call('HGET', ARGV[1], 'failedReason') or ''}
end
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then return {'delayed', ''} end
if redis.call('ZSCORE', KEYS[2], ARGV[2]) then return {'active', ''} end
return {'waiting', ''}
"#,
    )
});

fn map_redis_error(e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        QueueError::Unavailable(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Key layout of one named queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    fn new(queue_name: &str) -> Self {
        Self {
            prefix: format!("dq:{queue_name}"),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }
}

/// Queue over a shared Redis connection.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, queue_name: &str) -> Self {
        Self {
            conn,
            keys: QueueKeys::new(queue_name),
        }
    }

    fn lease_lost(job: &DeliveredJob) -> QueueError {
        QueueError::LeaseLost {
            job_id: job.id.to_string(),
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(
        &self,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobId, QueueError> {
        let (backoff_type, backoff_delay) = match options.backoff {
            Some(Backoff::Fixed { delay }) => ("fixed", delay),
            Some(Backoff::Exponential { delay }) => ("exponential", delay),
            None => ("", 0),
        };
        let mut conn = self.conn.clone();
        let id: u64 = ENQUEUE
            .key(self.keys.key("id"))
            .key(self.keys.key("wait"))
            .arg(&self.keys.prefix)
            .arg(data.to_string())
            .arg(options.max_attempts())
            .arg(backoff_type)
            .arg(backoff_delay)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(JobId::from(id))
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<DeliveredJob>, QueueError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let reply: Option<(String, Option<String>, Option<u32>, Option<u32>, i64)> = DEQUEUE
            .key(self.keys.key("wait"))
            .key(self.keys.key("active"))
            .key(self.keys.key("leases"))
            .key(self.keys.key("delayed"))
            .arg(&self.keys.prefix)
            .arg(now_ms())
            .arg(lease.as_millis() as u64)
            .arg(&token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some((id, data, attempts_made, max_attempts, stalled)) = reply else {
            return Ok(None);
        };
        if stalled > 0 {
            tracing::warn!(stalled, "Reclaimed jobs whose lease expired");
        }

        let id = JobId::new(id);
        // An unparseable payload is the processor's problem, not the queue's:
        // hand it over as a plain string.
        let data = match data {
            Some(raw) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
            None => {
                return Err(QueueError::Corrupt {
                    job_id: id.to_string(),
                    reason: "job hash has no data".to_string(),
                });
            }
        };

        Ok(Some(DeliveredJob {
            id,
            data,
            attempts_made: attempts_made.unwrap_or(0),
            max_attempts: max_attempts.unwrap_or(1),
            lease_token: token,
        }))
    }

    async fn extend_lease(&self, job: &DeliveredJob, lease: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let extended: i64 = EXTEND
            .key(self.keys.key("leases"))
            .arg(self.keys.job(&job.id))
            .arg(&job.lease_token)
            .arg(now_ms() + lease.as_millis() as i64)
            .arg(job.id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if extended == 1 {
            Ok(())
        } else {
            Err(Self::lease_lost(job))
        }
    }

    async fn ack(&self, job: &DeliveredJob, outcome: &JobOutcome) -> Result<(), QueueError> {
        let returnvalue = serde_json::to_string(outcome).map_err(|e| QueueError::Corrupt {
            job_id: job.id.to_string(),
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        let done: i64 = COMPLETE
            .key(self.keys.key("active"))
            .key(self.keys.key("leases"))
            .key(self.keys.key("completed"))
            .arg(self.keys.job(&job.id))
            .arg(&job.lease_token)
            .arg(job.id.as_str())
            .arg(returnvalue)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if done == 1 {
            Ok(())
        } else {
            Err(Self::lease_lost(job))
        }
    }

    async fn fail(&self, job: &DeliveredJob, reason: &str) -> Result<FailDisposition, QueueError> {
        let mut conn = self.conn.clone();
        let code: i64 = FAIL
            .key(self.keys.key("active"))
            .key(self.keys.key("leases"))
            .key(self.keys.key("wait"))
            .key(self.keys.key("delayed"))
            .key(self.keys.key("failed"))
            .arg(self.keys.job(&job.id))
            .arg(&job.lease_token)
            .arg(job.id.as_str())
            .arg(reason)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            -1 => Err(Self::lease_lost(job)),
            -2 => Ok(FailDisposition::Exhausted),
            delay => Ok(FailDisposition::Retry {
                delay: Duration::from_millis(delay.max(0) as u64),
            }),
        }
    }

    async fn state(&self, job_id: &JobId) -> Result<Option<QueueState>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Option<(String, String)> = STATE
            .key(self.keys.key("delayed"))
            .key(self.keys.key("leases"))
            .arg(self.keys.job(job_id))
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some((kind, value)) = reply else {
            return Ok(None);
        };
        let state = match kind.as_str() {
            "completed" => {
                let outcome = serde_json::from_str(&value).map_err(|e| QueueError::Corrupt {
                    job_id: job_id.to_string(),
                    reason: format!("bad returnvalue: {e}"),
                })?;
                QueueState::Completed(outcome)
            }
            "failed" => QueueState::Failed(value),
            "delayed" => QueueState::Delayed,
            "active" => QueueState::Active,
            _ => QueueState::Waiting,
        };
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = QueueKeys::new("download-queue");
        assert_eq!(keys.key("wait"), "dq:download-queue:wait");
        assert_eq!(keys.job(&JobId::new("9")), "dq:download-queue:job:9");
    }

    #[test]
    fn connection_errors_are_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            map_redis_error(redis::RedisError::from(io)),
            QueueError::Unavailable(_)
        ));
        assert!(matches!(
            map_redis_error(redis::RedisError::from((redis::ErrorKind::ResponseError, "NOSCRIPT"))),
            QueueError::Command(_)
        ));
    }

    // The tests below need a live server: `REDIS_URL=redis://... cargo test -- --ignored`.

    async fn live_queue() -> RedisQueue {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        let conn = crate::store::redis_backend::connect(&url)
            .await
            .expect("Redis reachable at REDIS_URL");
        RedisQueue::new(conn, &format!("test-{}", Uuid::new_v4()))
    }

    fn outcome() -> JobOutcome {
        JobOutcome {
            processed_files: 1,
            processing_time_ms: 5,
        }
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn stale_lease_token_cannot_ack_or_fail() {
        let queue = live_queue().await;
        let id = queue
            .enqueue(serde_json::json!({"fileIds": ["a"]}), &JobOptions::default().with_attempts(3))
            .await
            .unwrap();

        let stale = queue.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Lease lapsed: the next dequeue reclaims it under a new token.
        let current = queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(current.id, id);
        assert_ne!(current.lease_token, stale.lease_token);
        assert_eq!(current.attempts_made, 0);

        assert!(matches!(
            queue.ack(&stale, &outcome()).await,
            Err(QueueError::LeaseLost { .. })
        ));
        assert!(matches!(
            queue.fail(&stale, "late").await,
            Err(QueueError::LeaseLost { .. })
        ));
        assert!(matches!(
            queue.extend_lease(&stale, Duration::from_secs(30)).await,
            Err(QueueError::LeaseLost { .. })
        ));
        assert_eq!(queue.state(&id).await.unwrap(), Some(QueueState::Active));

        queue.ack(&current, &outcome()).await.unwrap();
        assert_eq!(
            queue.state(&id).await.unwrap(),
            Some(QueueState::Completed(outcome()))
        );
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn exponential_backoff_doubles_until_exhausted() {
        let queue = live_queue().await;
        let options = JobOptions::default()
            .with_attempts(3)
            .with_backoff(Backoff::Exponential { delay: 100 });
        let id = queue.enqueue(serde_json::json!({"fileIds": ["a"]}), &options).await.unwrap();
        let lease = Duration::from_secs(30);

        let first = queue.dequeue(lease).await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&first, "boom").await.unwrap(),
            FailDisposition::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(queue.state(&id).await.unwrap(), Some(QueueState::Delayed));
        assert!(queue.dequeue(lease).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = queue.dequeue(lease).await.unwrap().unwrap();
        assert_eq!(second.attempts_made, 1);
        assert_eq!(
            queue.fail(&second, "boom").await.unwrap(),
            FailDisposition::Retry {
                delay: Duration::from_millis(200)
            }
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        let third = queue.dequeue(lease).await.unwrap().unwrap();
        assert_eq!(third.attempts_made, 2);
        assert!(third.is_last_attempt());
        assert_eq!(
            queue.fail(&third, "boom").await.unwrap(),
            FailDisposition::Exhausted
        );
        assert_eq!(
            queue.state(&id).await.unwrap(),
            Some(QueueState::Failed("boom".to_string()))
        );
    }
}
