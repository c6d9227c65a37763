//! In-memory job store
//!
//! Every operation runs under one mutex, which makes `lease` atomic for all
//! callers inside the process. Use the Redis store when several processes
//! share the queues.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::{BullpenError, Result};
use crate::job::{Job, JobId, JobOptions, JobState};
use crate::store::{JobCounts, JobStore, ReclaimReport};
use crate::utils::Clock;

#[derive(Debug, Default)]
struct QueueData {
    jobs: HashMap<JobId, Job>,
    /// Waiting and delayed jobs ordered by (run_at, id)
    ready: BTreeSet<(u64, JobId)>,
    /// Active jobs ordered by (lease expiry, id)
    active: BTreeSet<(u64, JobId)>,
    next_id: JobId,
}

#[derive(Debug)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueData>>,
    clock: Clock,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Clock::System)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Clock) -> Self {
        MemoryStore {
            queues: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Simulate an outage: while unavailable every call fails with `StoreUnavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BullpenError::StoreUnavailable("memory store marked unavailable".to_string()))
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, queue: &str, payload: Value, options: &JobOptions) -> Result<JobId> {
        self.check_available()?;
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue.to_string()).or_default();

        data.next_id += 1;
        let job = Job::new(data.next_id, queue, payload, options, now);
        let id = job.id;
        debug!("Enqueued job {} on {} as {} (run_at {})", id, queue, job.state, job.run_at);

        data.ready.insert((job.run_at, id));
        data.jobs.insert(id, job);
        Ok(id)
    }

    async fn lease(&self, queue: &str, worker_id: &str, lease_duration: Duration) -> Result<Option<Job>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let Some(data) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let candidate = match data.ready.first() {
            Some(&(run_at, id)) if run_at <= now => (run_at, id),
            _ => return Ok(None),
        };
        data.ready.remove(&candidate);

        let id = candidate.1;
        let expires_at = now.saturating_add(lease_duration.as_millis() as u64);
        let Some(job) = data.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.activate(worker_id, expires_at, now);
        data.active.insert((expires_at, id));
        debug!("Worker {} leased job {} on {} until {}", worker_id, id, queue, expires_at);

        Ok(Some(job.clone()))
    }

    async fn ack(&self, queue: &str, job_id: JobId, worker_id: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let Some(data) = queues.get_mut(queue) else {
            return Ok(false);
        };
        let Some(job) = data.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !job.is_leased_by(worker_id) {
            return Ok(false);
        }

        let expires_at = job.lease.as_ref().map(|l| l.expires_at);
        if !job.complete(now) {
            return Ok(false);
        }
        if let Some(expires_at) = expires_at {
            data.active.remove(&(expires_at, job_id));
        }
        if job.remove_on_complete {
            data.jobs.remove(&job_id);
        }
        Ok(true)
    }

    async fn fail(&self, queue: &str, job_id: JobId, worker_id: &str, error: &str) -> Result<Option<Job>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let Some(data) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(job) = data.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !job.is_leased_by(worker_id) {
            return Ok(None);
        }

        let expires_at = job.lease.as_ref().map(|l| l.expires_at);
        if !job.fail(error, now) {
            return Ok(None);
        }
        if let Some(expires_at) = expires_at {
            data.active.remove(&(expires_at, job_id));
        }

        let job = job.clone();
        if !job.state.is_terminal() {
            data.ready.insert((job.run_at, job_id));
        } else if job.remove_on_fail {
            data.jobs.remove(&job_id);
        }
        Ok(Some(job))
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<ReclaimReport> {
        self.check_available()?;
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let mut report = ReclaimReport::default();
        let Some(data) = queues.get_mut(queue) else {
            return Ok(report);
        };

        let expired: Vec<(u64, JobId)> = data
            .active
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .copied()
            .collect();

        for entry in expired {
            data.active.remove(&entry);
            let Some(job) = data.jobs.get_mut(&entry.1) else {
                continue;
            };
            if job.expire_lease(now) {
                let job = job.clone();
                if job.remove_on_fail {
                    data.jobs.remove(&job.id);
                }
                report.failed.push(job);
            } else {
                data.ready.insert((job.run_at, job.id));
                report.requeued.push(job.id);
            }
        }
        Ok(report)
    }

    async fn promote_delayed(&self, queue: &str) -> Result<usize> {
        self.check_available()?;
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let Some(data) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let mut promoted = 0;
        for (_, id) in data.ready.iter().take_while(|(run_at, _)| *run_at <= now) {
            if let Some(job) = data.jobs.get_mut(id) {
                if job.promote(now) {
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    async fn get_job(&self, queue: &str, job_id: JobId) -> Result<Option<Job>> {
        self.check_available()?;
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).and_then(|data| data.jobs.get(&job_id)).cloned())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        self.check_available()?;
        let queues = self.queues.lock().await;
        let mut counts = JobCounts::default();
        if let Some(data) = queues.get(queue) {
            for job in data.jobs.values() {
                match job.state {
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Delayed => counts.delayed += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
        }
        Ok(counts)
    }
}
