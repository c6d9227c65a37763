use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::Job;

/// Shared value supplied by the host application (a server, a pool, ...)
pub type HostContext = Arc<dyn Any + Send + Sync>;

/// Per-invocation context handed to a handler
#[derive(Clone)]
pub struct JobContext {
    /// Queue the job was leased from
    pub queue_name: String,
    /// Worker slot that holds the lease
    pub worker_id: String,
    /// Attempt number, 1 for the first delivery
    pub attempt: u32,
    host: Option<HostContext>,
}

impl JobContext {
    pub fn new(queue_name: &str, worker_id: &str, attempt: u32, host: Option<HostContext>) -> Self {
        JobContext {
            queue_name: queue_name.to_string(),
            worker_id: worker_id.to_string(),
            attempt,
            host,
        }
    }

    /// Borrow the host context as `T`, if one of that type was supplied
    pub fn host<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.host.as_deref().and_then(|host| host.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("queue_name", &self.queue_name)
            .field("worker_id", &self.worker_id)
            .field("attempt", &self.attempt)
            .field("host", &self.host.is_some())
            .finish()
    }
}

/// Processes the jobs of one queue.
///
/// Delivery is at-least-once: a job whose lease expires is handed out
/// again, so handlers must tolerate running twice for the same job.
/// Returning `Err` records a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, job: &Job) -> anyhow::Result<()>;
}

/// Adapter that turns an async closure into a [`JobHandler`]
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &JobContext, job: &Job) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), job.clone()).await
    }
}

/// Build a handler from `|ctx, job| async move { ... }`
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}
