use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::time;

use bullpen::{handler_fn, Config, JobStore, MemoryStore, RedisStore, Registry, ShutdownMode, WorkerPool};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

async fn open_store(config: &Config) -> Arc<dyn JobStore> {
    match time::timeout(CONNECT_TIMEOUT, RedisStore::connect(&config.redis_url, &config.key_prefix)).await {
        Ok(Ok(store)) => Arc::new(store),
        Ok(Err(e)) => {
            warn!("Could not connect to Redis at {}: {}", config.redis_url, e);
            warn!("Using in-memory job store, jobs will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        Err(_) => {
            warn!("Timed out connecting to Redis at {}", config.redis_url);
            warn!("Using in-memory job store, jobs will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let config = Config::from_env().context("invalid configuration")?;
    let root = env::current_dir()?;
    info!("Bullpen starting in {}", root.display());

    let store = open_store(&config).await;

    // Manifests without an explicit handler fall back to the one named after their queue
    let log_handler = handler_fn(|ctx, job| async move {
        info!(
            "[{}] job {} attempt {}: {}",
            ctx.queue_name, job.id, ctx.attempt, job.data
        );
        Ok(())
    });

    let registry = Registry::builder()
        .store(store)
        .handler("log", log_handler)
        .discover(&root, config.discovery_options())
        .on_error(|queue, err| warn!("Queue {} error: {}", queue, err))
        .on_job_failed(|queue, job, err| warn!("Job {} on {} failed: {}", job.id, queue, err))
        .build()
        .context("failed to build queue registry")?;

    if registry.is_empty() {
        warn!("No queue manifests found under {}", root.display());
    }
    for name in registry.names() {
        info!("Serving queue {}", name);
    }

    let pool = WorkerPool::start(&registry, config.worker_config())?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    registry.close_all();
    pool.shutdown(ShutdownMode::Graceful).await;

    for name in registry.names() {
        if let Some(queue) = registry.queue(name) {
            match queue.counts().await {
                Ok(counts) => info!("Queue {} final counts: {:?}", name, counts),
                Err(e) => warn!("Could not read counts for {}: {}", name, e),
            }
        }
    }
    Ok(())
}
