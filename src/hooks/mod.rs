use std::sync::Arc;

use log::error;

use crate::errors::BullpenError;
use crate::job::Job;

/// Called for store or transport errors not tied to a single job
pub type ErrorHook = Arc<dyn Fn(&str, &BullpenError) + Send + Sync>;

/// Called when an attempt fails, including the final transition to failed
pub type JobFailedHook = Arc<dyn Fn(&str, &Job, &BullpenError) + Send + Sync>;

/// Observer callbacks of a registry
#[derive(Clone)]
pub struct Hooks {
    on_error: ErrorHook,
    on_job_failed: JobFailedHook,
}

fn default_on_error(queue: &str, err: &BullpenError) {
    error!("Queue {}: {}", queue, err);
}

fn default_on_job_failed(queue: &str, job: &Job, err: &BullpenError) {
    error!(
        "Queue {}: job {} failed (attempt {}/{}, {}): {}",
        queue, job.id, job.attempts_made, job.max_attempts, job.state, err
    );
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks {
            on_error: Arc::new(default_on_error),
            on_job_failed: Arc::new(default_on_job_failed),
        }
    }
}

impl Hooks {
    pub fn set_on_error<F>(&mut self, hook: F)
    where
        F: Fn(&str, &BullpenError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(hook);
    }

    pub fn set_on_job_failed<F>(&mut self, hook: F)
    where
        F: Fn(&str, &Job, &BullpenError) + Send + Sync + 'static,
    {
        self.on_job_failed = Arc::new(hook);
    }

    pub fn error(&self, queue: &str, err: &BullpenError) {
        (self.on_error)(queue, err);
    }

    pub fn job_failed(&self, queue: &str, job: &Job, err: &BullpenError) {
        (self.on_job_failed)(queue, job, err);
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}
