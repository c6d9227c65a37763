//! Job store abstraction
//!
//! The store is the single owner of job records. Queues and workers only
//! hold job ids and go back to the store for every transition, so the store
//! is also where lease atomicity is enforced.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::job::{Job, JobId, JobOptions};

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Number of jobs per state for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Outcome of a reclaim pass
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    /// Jobs returned to waiting
    pub requeued: Vec<JobId>,
    /// Jobs whose lease expired more often than their attempt budget
    pub failed: Vec<Job>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `waiting`, or `delayed` when its due time is in the future
    async fn enqueue(&self, queue: &str, payload: Value, options: &JobOptions) -> Result<JobId>;

    /// Atomically move the oldest eligible job to `active` under a lease.
    /// Never blocks; `None` when nothing is due.
    async fn lease(&self, queue: &str, worker_id: &str, lease_duration: Duration) -> Result<Option<Job>>;

    /// Active -> completed. Returns false (no-op) unless `worker_id` holds
    /// the current lease.
    async fn ack(&self, queue: &str, job_id: JobId, worker_id: &str) -> Result<bool>;

    /// Active -> waiting with backoff, or failed once attempts are exhausted.
    /// Returns the updated job, `None` unless `worker_id` holds the current lease.
    async fn fail(&self, queue: &str, job_id: JobId, worker_id: &str, error: &str) -> Result<Option<Job>>;

    /// Return jobs with expired leases to waiting
    async fn reclaim_expired(&self, queue: &str) -> Result<ReclaimReport>;

    /// Move due delayed jobs to waiting, returns how many moved
    async fn promote_delayed(&self, queue: &str) -> Result<usize>;

    async fn get_job(&self, queue: &str, job_id: JobId) -> Result<Option<Job>>;

    async fn counts(&self, queue: &str) -> Result<JobCounts>;
}
