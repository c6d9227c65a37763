use bullpen::{handler_fn, RedisStore, Registry, ShutdownMode, WorkerConfig, WorkerPool};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// This example demonstrates the basic usage of Bullpen
/// with a simple producer-consumer pattern.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Connect the job store
    let store = RedisStore::connect("redis://127.0.0.1:6379", "bullpen-example").await?;

    // Define the job handler
    let handler = handler_fn(|ctx, job| async move {
        println!("Processing job ID: {} on {}", job.id, ctx.queue_name);
        println!("Job data: {}", job.data);

        // Simulate some work
        sleep(Duration::from_millis(500)).await;
        Ok(())
    });

    let registry = Registry::builder()
        .store(Arc::new(store))
        .queue("example-queue", handler)
        .build()?;

    // Producer: Add jobs to the queue
    println!("Adding jobs to the queue...");
    for i in 1..=5 {
        let id = registry
            .enqueue(
                "example-queue",
                json!({
                    "job_index": i,
                    "message": format!("This is job number {}", i)
                }),
                None,
            )
            .await?;
        println!("Added job with ID: {}", id);
    }

    // Consumer: start a pool to process the jobs
    println!("\nStarting worker pool to process jobs...");
    let config = WorkerConfig {
        concurrency: 2, // Process up to 2 jobs concurrently
        ..WorkerConfig::default()
    };
    let pool = WorkerPool::start(&registry, config)?;

    println!("Waiting for jobs to be processed...");
    sleep(Duration::from_secs(5)).await;

    if let Some(queue) = registry.queue("example-queue") {
        let counts = queue.counts().await?;
        println!("\nQueue statistics:");
        println!("  Waiting: {}", counts.waiting);
        println!("  Active: {}", counts.active);
        println!("  Completed: {}", counts.completed);
        println!("  Failed: {}", counts.failed);
    }

    pool.shutdown(ShutdownMode::Graceful).await;
    println!("Worker pool stopped");

    Ok(())
}
