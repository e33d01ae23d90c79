//! Configuration types.
//!
//! Everything is read from environment variables. Parsing goes through
//! [`WorkerConfig::from_lookup`] so tests can feed a map instead of mutating
//! the process environment.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Key-value store / queue connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

/// S3-compatible object store settings (MinIO in development).
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub port: u16,
    pub use_ssl: bool,
    pub region: String,
    pub access_key: String,
    pub secret_key: SecretString,
}

impl ObjectStoreConfig {
    /// Full endpoint URL. A scheme already present in `endpoint` wins.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            return self.endpoint.clone();
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.endpoint, self.port)
    }
}

/// Bounds of the simulated download delay, `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(10_000),
            max_delay: Duration::from_millis(20_000),
        }
    }
}

/// Worker pool and lifecycle settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Queue the pool consumes from.
    pub queue_name: String,
    /// Bucket that receives result artifacts.
    pub bucket: String,
    /// Number of concurrent job slots.
    pub concurrency: usize,
    /// Lease requested from the queue per delivery; renewed at half this interval.
    pub lock_duration: Duration,
    /// Sleep between empty dequeue polls.
    pub poll_interval: Duration,
    /// How long terminal status records are kept.
    pub status_retention: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_name: "download-queue".to_string(),
            bucket: "download-results".to_string(),
            concurrency: 1,
            lock_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            status_retention: Duration::from_secs(86_400), // 24 hours
        }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis: RedisConfig,
    pub object_store: ObjectStoreConfig,
    pub simulation: SimulationConfig,
    pub pool: PoolConfig,
    pub api_port: u16,
}

impl WorkerConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    ///
    /// Missing object-store credentials are a hard error: the worker refuses to
    /// start rather than running without anywhere to put results.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let redis_defaults = RedisConfig::default();
        let redis = RedisConfig {
            host: var("REDIS_HOST").unwrap_or(redis_defaults.host),
            port: parse_or(&var, "REDIS_PORT", redis_defaults.port)?,
        };

        let object_store = ObjectStoreConfig {
            endpoint: require(&var, "MINIO_ENDPOINT")?,
            port: parse_or(&var, "MINIO_PORT", 9000)?,
            use_ssl: parse_or(&var, "MINIO_USE_SSL", false)?,
            region: var("MINIO_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key: require(&var, "MINIO_ACCESS_KEY")?,
            secret_key: SecretString::from(require(&var, "MINIO_SECRET_KEY")?),
        };

        let sim_defaults = SimulationConfig::default();
        let min_ms: u64 = parse_or(
            &var,
            "DOWNLOAD_DELAY_MIN_MS",
            sim_defaults.min_delay.as_millis() as u64,
        )?;
        let max_ms: u64 = parse_or(
            &var,
            "DOWNLOAD_DELAY_MAX_MS",
            sim_defaults.max_delay.as_millis() as u64,
        )?;
        if min_ms > max_ms {
            return Err(ConfigError::InvalidValue {
                key: "DOWNLOAD_DELAY_MAX_MS".to_string(),
                message: format!("must be >= DOWNLOAD_DELAY_MIN_MS ({min_ms}), got {max_ms}"),
            });
        }
        let simulation = SimulationConfig {
            min_delay: Duration::from_millis(min_ms),
            max_delay: Duration::from_millis(max_ms),
        };

        let pool_defaults = PoolConfig::default();
        let concurrency: usize = parse_or(&var, "WORKER_CONCURRENCY", pool_defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let lock_ms: u64 = parse_or(
            &var,
            "WORKER_LOCK_DURATION_MS",
            pool_defaults.lock_duration.as_millis() as u64,
        )?;
        if lock_ms < 1_000 {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_LOCK_DURATION_MS".to_string(),
                message: format!("must be at least 1000, got {lock_ms}"),
            });
        }
        let pool = PoolConfig {
            queue_name: var("DOWNLOAD_QUEUE_NAME").unwrap_or(pool_defaults.queue_name),
            bucket: var("DOWNLOAD_RESULTS_BUCKET").unwrap_or(pool_defaults.bucket),
            concurrency,
            lock_duration: Duration::from_millis(lock_ms),
            poll_interval: Duration::from_millis(parse_or(
                &var,
                "QUEUE_POLL_INTERVAL_MS",
                pool_defaults.poll_interval.as_millis() as u64,
            )?),
            status_retention: Duration::from_secs(parse_or(
                &var,
                "JOB_STATUS_TTL_SECS",
                pool_defaults.status_retention.as_secs(),
            )?),
        };

        Ok(Self {
            redis,
            object_store,
            simulation,
            pool,
            api_port: parse_or(&var, "API_PORT", 3000)?,
        })
    }
}

fn require<F>(var: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    var(key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: "Object store credentials are required (MINIO_ENDPOINT, MINIO_ACCESS_KEY, MINIO_SECRET_KEY).".to_string(),
    })
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}
