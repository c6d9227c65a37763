use anyhow::anyhow;
use bullpen::{
    handler_fn, BackoffOptions, JobOptions, JobState, MemoryStore, Registry, ShutdownMode, WorkerConfig, WorkerPool,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// This example demonstrates error handling and automatic retry behavior
/// for failed jobs in Bullpen.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Define a handler that simulates failure
    let handler = handler_fn(|ctx, job| async move {
        let fail_until_attempt = job
            .data
            .get("fail_until_attempt")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        println!(
            "Processing job ID: {} (attempt {}/{})",
            job.id, ctx.attempt, job.max_attempts
        );

        if ctx.attempt < fail_until_attempt {
            println!("  This attempt will fail!");
            return Err(anyhow!("Simulated failure"));
        }

        println!("  Job processed successfully!");
        Ok(())
    });

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("retry-queue", handler)
        .on_job_failed(|queue, job, err| {
            println!(
                "  [{}] job {} failed ({}/{} attempts, now {}): {}",
                queue, job.id, job.attempts_made, job.max_attempts, job.state, err
            );
        })
        .on_error(|queue, err| eprintln!("  [{}] store error: {}", queue, err))
        .build()?;

    // Allow up to 3 attempts, 500ms apart
    let retry_options = JobOptions::default()
        .with_attempts(3)
        .with_backoff(BackoffOptions::fixed(500));

    println!("Adding jobs with retry configuration...");
    let recovers = registry
        .enqueue("retry-queue", json!({ "fail_until_attempt": 2 }), Some(retry_options.clone()))
        .await?;
    let gives_up = registry
        .enqueue("retry-queue", json!({ "fail_until_attempt": 10 }), Some(retry_options))
        .await?;

    println!("\nStarting worker pool to process jobs with retry logic...");
    let pool = WorkerPool::start(&registry, WorkerConfig::default())?;

    println!("Waiting for job processing and retries...");
    sleep(Duration::from_secs(4)).await;

    println!("\nJob processing results:");
    if let Some(queue) = registry.queue("retry-queue") {
        for id in [recovers, gives_up] {
            if let Some(job) = queue.get_job(id).await? {
                match job.state {
                    JobState::Completed => println!("  Job {} completed after {} failed attempt(s)", job.id, job.attempts_made),
                    JobState::Failed => println!(
                        "  Job {} failed after {} attempts: {}",
                        job.id,
                        job.attempts_made,
                        job.last_error.unwrap_or_default()
                    ),
                    state => println!("  Job {} is still {}", job.id, state),
                }
            }
        }
    }

    pool.shutdown(ShutdownMode::Graceful).await;
    println!("Worker pool stopped");

    Ok(())
}
