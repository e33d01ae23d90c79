use std::sync::Arc;

use anyhow::Context;

use download_worker::api::{self, AppState};
use download_worker::config::WorkerConfig;
use download_worker::jobs::{
    JobProcessor, JobProducer, PoolSettings, ProcessorDeps, ProcessorSettings, SimulatedDownload,
    WorkerPool,
};
use download_worker::queue::{JobQueue, RedisQueue};
use download_worker::store::{
    ArtifactStore, RedisStatusStore, S3ArtifactStore, StatusStore, redis_backend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env().context("invalid configuration")?;

    eprintln!("Download worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Redis: {}", config.redis.url());
    eprintln!("   Object store: {}", config.object_store.endpoint_url());
    eprintln!("   Queue: {}", config.pool.queue_name);
    eprintln!("   Concurrency: {}", config.pool.concurrency);
    eprintln!("   API: http://0.0.0.0:{}/api/downloads\n", config.api_port);

    // ── Collaborators ───────────────────────────────────────────────────
    let redis_url = config.redis.url();
    let conn = redis_backend::connect(&redis_url)
        .await
        .with_context(|| format!("could not connect to Redis at {redis_url}"))?;

    let status: Arc<dyn StatusStore> = Arc::new(RedisStatusStore::new(conn.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(conn, &config.pool.queue_name));
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(S3ArtifactStore::new(&config.object_store));

    artifacts
        .ensure_bucket(&config.pool.bucket)
        .await
        .with_context(|| format!("could not provision bucket {}", config.pool.bucket))?;

    // ── Worker pool ─────────────────────────────────────────────────────
    let processor = Arc::new(JobProcessor::new(
        ProcessorDeps {
            status: Arc::clone(&status),
            artifacts,
            work: Arc::new(SimulatedDownload::new(config.simulation)),
        },
        ProcessorSettings::from(&config.pool),
    ));
    let pool = WorkerPool::new(
        Arc::clone(&queue),
        processor,
        PoolSettings::from(&config.pool),
    )
    .spawn();

    // ── HTTP API ────────────────────────────────────────────────────────
    let app = api::routes(AppState {
        producer: JobProducer::new(queue),
        status,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port))
        .await
        .with_context(|| format!("could not bind API port {}", config.api_port))?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("could not listen for Ctrl+C")?;
    tracing::info!("Shutting down");

    server.abort();
    pool.shutdown().await;
    Ok(())
}
