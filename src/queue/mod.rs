use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};

use crate::errors::{BullpenError, Result};
use crate::handler::JobHandler;
use crate::job::{Job, JobId, JobOptions};
use crate::store::{JobCounts, JobStore};
use crate::utils::validate_queue_name;

/// Named channel of jobs backed by the shared job store
pub struct Queue {
    /// Queue name, also the key in the registry
    name: String,
    /// Job store shared with every other queue
    store: Arc<dyn JobStore>,
    /// Options applied to jobs that leave them unset
    defaults: JobOptions,
    /// The one handler bound to this queue
    handler: RwLock<Option<Arc<dyn JobHandler>>>,
    /// Set once the queue is closed
    closed: AtomicBool,
    /// Wakes idle worker slots on enqueue
    notify: Arc<Notify>,
}

impl Queue {
    /// Create a new queue
    pub fn new(name: &str, store: Arc<dyn JobStore>, defaults: JobOptions) -> Result<Self> {
        Self::with_notify(name, store, defaults, Arc::new(Notify::new()))
    }

    pub(crate) fn with_notify(
        name: &str,
        store: Arc<dyn JobStore>,
        defaults: JobOptions,
        notify: Arc<Notify>,
    ) -> Result<Self> {
        validate_queue_name(name)?;

        Ok(Queue {
            name: name.to_string(),
            store,
            defaults,
            handler: RwLock::new(None),
            closed: AtomicBool::new(false),
            notify,
        })
    }

    /// Bind a handler before the queue is shared
    pub(crate) fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        *self.handler.get_mut() = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Bind the handler. A queue holds at most one; unregister first to replace it.
    pub async fn register(&self, handler: Arc<dyn JobHandler>) -> Result<()> {
        let mut slot = self.handler.write().await;
        if slot.is_some() {
            return Err(BullpenError::DuplicateHandler(self.name.clone()));
        }
        *slot = Some(handler);
        info!("Registered handler for queue {}", self.name);

        // Jobs may already be waiting
        self.notify.notify_one();
        Ok(())
    }

    /// Remove the handler, returning the previous one
    pub async fn unregister(&self) -> Option<Arc<dyn JobHandler>> {
        self.handler.write().await.take()
    }

    pub async fn handler(&self) -> Option<Arc<dyn JobHandler>> {
        self.handler.read().await.clone()
    }

    pub async fn has_handler(&self) -> bool {
        self.handler.read().await.is_some()
    }

    /// Add a job to the queue
    pub async fn enqueue(&self, payload: Value, options: Option<JobOptions>) -> Result<JobId> {
        if self.is_closed() {
            return Err(BullpenError::QueueClosed(self.name.clone()));
        }

        let options = options.unwrap_or_default().merged_with(&self.defaults);
        let id = self.store.enqueue(&self.name, payload, &options).await?;
        self.notify.notify_one();
        Ok(id)
    }

    /// Get a job by ID
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.store.get_job(&self.name, job_id).await
    }

    /// Get queue counts (waiting, delayed, active, completed, failed)
    pub async fn counts(&self) -> Result<JobCounts> {
        self.store.counts(&self.name).await
    }

    /// Stop handing out leases for this queue. Jobs already leased finish
    /// or time out on their own.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed queue {}", self.name);
            self.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
