pub mod errors;
pub mod utils;
pub mod commands;
pub mod config;

// Core modules
pub mod backoff;
pub mod job;
pub mod store;
pub mod handler;
pub mod hooks;
pub mod queue;
pub mod scheduler;
pub mod worker;
pub mod discovery;
pub mod registry;

// Re-export main components for easier access
pub use backoff::{BackoffOptions, BackoffStrategy};
pub use config::Config;
pub use discovery::{DiscoveryOptions, QueueManifest};
pub use errors::{BullpenError, Result};
pub use handler::{handler_fn, JobContext, JobHandler};
pub use hooks::Hooks;
pub use job::{Job, JobId, JobOptions, JobState};
pub use queue::Queue;
pub use registry::{Registry, RegistryBuilder};
pub use scheduler::{Scheduler, TickReport};
pub use store::{JobCounts, JobStore, MemoryStore, RedisStore, ReclaimReport};
pub use utils::Clock;
pub use worker::{ShutdownMode, WorkerConfig, WorkerPool};
