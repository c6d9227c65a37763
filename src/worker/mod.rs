//! Worker pool: N execution slots leasing jobs from the bound queues

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use crate::errors::{BullpenError, Result};
use crate::handler::{HostContext, JobContext, JobHandler};
use crate::hooks::Hooks;
use crate::job::Job;
use crate::queue::Queue;
use crate::registry::Registry;
use crate::scheduler::Scheduler;

/// Worker pool configuration
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Number of concurrent execution slots
    pub concurrency: usize,
    /// How long an idle slot sleeps when no enqueue wakes it
    pub poll_interval: Duration,
    /// Lease length. A handler invocation is cut off shortly before it runs out.
    pub lease_duration: Duration,
    /// Scheduler period, half the lease duration when unset
    pub reclaim_interval: Option<Duration>,
    /// Pause after a store error before a slot tries again
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(30),
            reclaim_interval: None,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Upper bound on how much earlier than the lease a handler is cut off
const MAX_LEASE_MARGIN: Duration = Duration::from_millis(500);

impl WorkerConfig {
    /// Time a handler gets, measured from the lease request. Ends before the
    /// store lease does, so a timed out job is never acked after it was reclaimed.
    pub fn handler_timeout(&self) -> Duration {
        let margin = (self.lease_duration / 20).min(MAX_LEASE_MARGIN);
        self.lease_duration - margin
    }

    pub fn reclaim_interval(&self) -> Duration {
        self.reclaim_interval
            .unwrap_or(self.lease_duration / 2)
            .max(Duration::from_millis(1))
    }
}

/// How to stop a running pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop leasing and wait for in-flight jobs to finish
    Graceful,
    /// Stop leasing, wait at most `timeout`, then abort in-flight jobs.
    /// Aborted jobs keep their lease and are redelivered once it expires.
    Hard { timeout: Duration },
}

struct Shared {
    queues: Vec<Arc<Queue>>,
    hooks: Hooks,
    host: Option<HostContext>,
    notify: Arc<Notify>,
    config: WorkerConfig,
    in_flight: AtomicUsize,
}

enum Poll {
    Leased(Arc<Queue>, Arc<dyn JobHandler>, Job, time::Instant),
    Idle,
    Errored,
}

/// Aborts the wrapped task when dropped, so cancelling a slot also
/// cancels the handler it is waiting on
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Counts a job as in flight for as long as it lives
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    id: String,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    slots: Vec<JoinHandle<()>>,
    scheduler: JoinHandle<()>,
}

impl WorkerPool {
    /// Start a pool over every queue of the registry
    pub fn start(registry: &Registry, config: WorkerConfig) -> Result<Self> {
        let names: Vec<String> = registry.names().map(str::to_string).collect();
        Self::start_bound(registry, &names, config)
    }

    /// Start a pool bound to the named queues, polled round-robin
    pub fn start_bound<S: AsRef<str>>(registry: &Registry, names: &[S], config: WorkerConfig) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(BullpenError::InvalidArgument("concurrency must be at least 1".to_string()));
        }
        if config.lease_duration.is_zero() {
            return Err(BullpenError::InvalidArgument("lease duration must be positive".to_string()));
        }

        let mut queues = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let queue = registry
                .queue(name)
                .ok_or_else(|| BullpenError::InvalidArgument(format!("unknown queue {}", name)))?;
            queues.push(queue);
        }

        let shared = Arc::new(Shared {
            queues,
            hooks: registry.hooks().clone(),
            host: registry.host(),
            notify: registry.notifier(),
            config,
            in_flight: AtomicUsize::new(0),
        });

        let id = Uuid::new_v4().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let slots = (0..config.concurrency)
            .map(|slot| {
                let worker_id = format!("{}:{}", id, slot);
                tokio::spawn(run_slot(shared.clone(), worker_id, shutdown_rx.clone()))
            })
            .collect();

        let scheduler = Scheduler::new(shared.queues.clone(), shared.hooks.clone(), shared.notify.clone());
        let scheduler = tokio::spawn(scheduler.run(config.reclaim_interval(), shutdown_rx));

        info!(
            "Worker pool {} started with concurrency {} on {} queue(s)",
            id,
            config.concurrency,
            shared.queues.len()
        );

        Ok(WorkerPool {
            id,
            shared,
            shutdown_tx,
            slots,
            scheduler,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of jobs currently being handled
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Stop the pool
    pub async fn shutdown(self, mode: ShutdownMode) {
        let WorkerPool {
            id,
            shared,
            shutdown_tx,
            mut slots,
            scheduler,
        } = self;

        info!("Shutting down worker pool {} ({:?})", id, mode);
        // Receivers may already be gone if every slot exited
        let _ = shutdown_tx.send(true);
        shared.notify.notify_waiters();

        match mode {
            ShutdownMode::Graceful => {
                join_all(slots.iter_mut()).await;
            }
            ShutdownMode::Hard { timeout } => {
                if time::timeout(timeout, join_all(slots.iter_mut())).await.is_err() {
                    warn!(
                        "Worker pool {}: aborting {} in-flight job(s) after {:?}",
                        id,
                        shared.in_flight.load(Ordering::SeqCst),
                        timeout
                    );
                    for slot in &slots {
                        slot.abort();
                    }
                    join_all(slots).await;
                }
            }
        }

        let _ = scheduler.await;
        info!("Worker pool {} stopped", id);
    }
}

async fn run_slot(shared: Arc<Shared>, worker_id: String, mut shutdown: watch::Receiver<bool>) {
    let mut cursor = 0usize;
    debug!("Worker slot {} started", worker_id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let pause = match poll_queues(&shared, &worker_id, &mut cursor).await {
            Poll::Leased(queue, handler, job, deadline) => {
                process_job(&shared, &worker_id, &queue, handler, job, deadline).await;
                continue;
            }
            Poll::Idle => shared.config.poll_interval,
            Poll::Errored => shared.config.error_backoff,
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shared.notify.notified() => {}
            _ = time::sleep(pause) => {}
        }
    }
    debug!("Worker slot {} stopped", worker_id);
}

/// Try each bound queue once, starting after the last one that produced a job
async fn poll_queues(shared: &Shared, worker_id: &str, cursor: &mut usize) -> Poll {
    let count = shared.queues.len();
    let mut errored = false;

    for step in 0..count {
        let index = (*cursor + step) % count;
        let queue = &shared.queues[index];
        if queue.is_closed() {
            continue;
        }
        let Some(handler) = queue.handler().await else {
            continue;
        };

        // The store starts the lease clock no earlier than this
        let requested_at = time::Instant::now();
        match queue
            .store()
            .lease(queue.name(), worker_id, shared.config.lease_duration)
            .await
        {
            Ok(Some(job)) => {
                *cursor = index + 1;
                let deadline = requested_at + shared.config.handler_timeout();
                return Poll::Leased(queue.clone(), handler, job, deadline);
            }
            Ok(None) => {}
            Err(e) => {
                errored = true;
                shared.hooks.error(queue.name(), &e);
            }
        }
    }

    if errored {
        Poll::Errored
    } else {
        Poll::Idle
    }
}

enum Outcome {
    Success,
    Failed(String),
    TimedOut,
}

async fn process_job(
    shared: &Shared,
    worker_id: &str,
    queue: &Queue,
    handler: Arc<dyn JobHandler>,
    job: Job,
    deadline: time::Instant,
) {
    let job_id = job.id;
    let ctx = JobContext::new(queue.name(), worker_id, job.attempts_made + 1, shared.host.clone());

    let _in_flight = InFlight::enter(&shared.in_flight);
    debug!("Worker {} processing job {} on {}", worker_id, job_id, queue.name());

    // The handler runs in its own task so that a panic stays inside it
    let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(&ctx, &job).await }));
    let outcome = match time::timeout_at(deadline, &mut task.0).await {
        Ok(Ok(Ok(()))) => Outcome::Success,
        Ok(Ok(Err(e))) => Outcome::Failed(format!("{:#}", e)),
        Ok(Err(e)) if e.is_panic() => Outcome::Failed("handler panicked".to_string()),
        Ok(Err(e)) => Outcome::Failed(e.to_string()),
        Err(_) => Outcome::TimedOut,
    };
    drop(task);

    let store = queue.store();
    match outcome {
        Outcome::Success => match store.ack(queue.name(), job_id, worker_id).await {
            Ok(true) => debug!("Job {} on {} completed", job_id, queue.name()),
            Ok(false) => warn!("Job {} on {} was no longer leased by {} when acked", job_id, queue.name(), worker_id),
            Err(e) => shared.hooks.error(queue.name(), &e),
        },
        Outcome::Failed(message) => {
            let err = BullpenError::HandlerError(message);
            match store.fail(queue.name(), job_id, worker_id, &err.to_string()).await {
                Ok(Some(job)) => shared.hooks.job_failed(queue.name(), &job, &err),
                Ok(None) => warn!("Job {} on {} was no longer leased by {} when failed", job_id, queue.name(), worker_id),
                Err(e) => shared.hooks.error(queue.name(), &e),
            }
        }
        Outcome::TimedOut => warn!(
            "Job {} on {} ran past its lease of {:?}; it will be redelivered",
            job_id,
            queue.name(),
            shared.config.lease_duration
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert!(config.concurrency > 0);
        assert!(config.poll_interval.as_millis() > 0);
        assert_eq!(config.reclaim_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_reclaim_interval_override() {
        let config = WorkerConfig {
            reclaim_interval: Some(Duration::from_millis(250)),
            ..Default::default()
        };
        assert_eq!(config.reclaim_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_handler_deadline_precedes_lease_expiry() {
        let config = WorkerConfig::default();
        assert_eq!(config.handler_timeout(), Duration::from_millis(29_500));

        let short = WorkerConfig {
            lease_duration: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(short.handler_timeout(), Duration::from_millis(95));
        assert!(short.handler_timeout() < short.lease_duration);
    }

    #[tokio::test]
    async fn test_abort_on_drop_cancels_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let guard = AbortOnDrop(tokio::spawn(async move {
            time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(());
        }));
        drop(guard);

        // Sender dropped by the abort, not sent
        assert!(rx.await.is_err());
    }
}
