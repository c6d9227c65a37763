//! Timing side of dispatch: promotes due delayed jobs and returns jobs with
//! expired leases to their queue.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{watch, Notify};
use tokio::time::{self, MissedTickBehavior};

use crate::errors::BullpenError;
use crate::hooks::Hooks;
use crate::queue::Queue;

/// What one scheduler pass did across all queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub requeued: usize,
    pub failed: usize,
    pub errors: usize,
}

pub struct Scheduler {
    queues: Vec<Arc<Queue>>,
    hooks: Hooks,
    notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(queues: Vec<Arc<Queue>>, hooks: Hooks, notify: Arc<Notify>) -> Self {
        Scheduler { queues, hooks, notify }
    }

    /// Run one promote + reclaim pass over every queue
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for queue in &self.queues {
            let store = queue.store();

            match store.promote_delayed(queue.name()).await {
                Ok(promoted) => report.promoted += promoted,
                Err(e) => {
                    report.errors += 1;
                    self.hooks.error(queue.name(), &e);
                }
            }

            match store.reclaim_expired(queue.name()).await {
                Ok(reclaimed) => {
                    if !reclaimed.requeued.is_empty() {
                        warn!(
                            "Queue {}: requeued {} job(s) with expired leases {:?}",
                            queue.name(),
                            reclaimed.requeued.len(),
                            reclaimed.requeued
                        );
                    }
                    report.requeued += reclaimed.requeued.len();
                    report.failed += reclaimed.failed.len();
                    for job in &reclaimed.failed {
                        self.hooks.job_failed(queue.name(), job, &BullpenError::LeaseExpired(job.id));
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    self.hooks.error(queue.name(), &e);
                }
            }
        }

        if report.promoted + report.requeued > 0 {
            debug!("Scheduler pass: {:?}", report);
            self.notify.notify_waiters();
        }
        report
    }

    /// Tick every `interval` until `shutdown` flips to true
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
        }
        debug!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobState};
    use crate::store::{JobStore, MemoryStore};
    use crate::utils::Clock;
    use serde_json::json;
    use std::sync::Mutex;

    fn setup() -> (Arc<MemoryStore>, Arc<Queue>, Hooks, Arc<Mutex<Vec<String>>>) {
        let store = Arc::new(MemoryStore::with_clock(Clock::manual(0)));
        let queue = Arc::new(Queue::new("test", store.clone(), JobOptions::default()).unwrap());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::default();
        let failed = seen.clone();
        hooks.set_on_job_failed(move |queue, job, err| {
            failed.lock().unwrap().push(format!("{} {} {}", queue, job.id, err));
        });
        (store, queue, hooks, seen)
    }

    #[tokio::test]
    async fn test_tick_promotes_and_reclaims() {
        let (store, queue, hooks, _) = setup();
        let scheduler = Scheduler::new(vec![queue.clone()], hooks, Arc::new(Notify::new()));

        let delayed = queue.enqueue(json!({}), Some(JobOptions::delayed(50))).await.unwrap();
        let leased = queue.enqueue(json!({}), None).await.unwrap();
        store.lease("test", "w", Duration::from_millis(100)).await.unwrap().unwrap();

        assert_eq!(scheduler.tick().await, TickReport::default());

        store.clock().advance(100);
        let report = scheduler.tick().await;
        assert_eq!(report.promoted, 1);
        assert_eq!(report.requeued, 1);

        assert_eq!(queue.get_job(delayed).await.unwrap().unwrap().state, JobState::Waiting);
        assert_eq!(queue.get_job(leased).await.unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_tick_reports_lease_failures() {
        let (store, queue, hooks, seen) = setup();
        let scheduler = Scheduler::new(vec![queue.clone()], hooks, Arc::new(Notify::new()));
        let id = queue.enqueue(json!({}), None).await.unwrap();

        for _ in 0..2 {
            store.lease("test", "w", Duration::from_millis(10)).await.unwrap().unwrap();
            store.clock().advance(10);
            scheduler.tick().await;
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], format!("test {} Lease expired for job {}", id, id));
    }

    #[tokio::test]
    async fn test_tick_reports_store_errors() {
        let (store, queue, mut hooks, _) = setup();
        let errors = Arc::new(Mutex::new(0));
        let counter = errors.clone();
        hooks.set_on_error(move |_, err| {
            assert!(err.is_store_error());
            *counter.lock().unwrap() += 1;
        });
        let scheduler = Scheduler::new(vec![queue], hooks, Arc::new(Notify::new()));

        store.set_available(false);
        let report = scheduler.tick().await;
        assert_eq!(report.errors, 2);
        assert_eq!(*errors.lock().unwrap(), 2);
    }
}
