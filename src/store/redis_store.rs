//! Redis-backed job store
//!
//! Key layout per queue, under `{prefix}:{queue}`:
//!
//! - `:id` job id counter
//! - `:job:<padded id>` job hash
//! - `:ready` sorted set of waiting and delayed jobs, scored by `run_at`
//! - `:active` sorted set of leased jobs, scored by lease expiry
//! - `:completed`, `:failed` lists of finished jobs
//!
//! Members are zero padded ids so equal scores fall back to id order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;

use crate::commands::Commands;
use crate::errors::{BullpenError, Result};
use crate::job::{Job, JobId, JobOptions};
use crate::store::{JobCounts, JobStore, ReclaimReport};
use crate::utils::{pad_id, Clock};

/// Default key prefix, same as Bull
pub const DEFAULT_PREFIX: &str = "bull";

struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn id(&self) -> String {
        format!("{}:id", self.base)
    }

    fn ready(&self) -> String {
        format!("{}:ready", self.base)
    }

    fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: JobId) -> String {
        format!("{}:job:{}", self.base, pad_id(id))
    }
}

/// Job store shared by every queue and worker slot of the process.
/// `ConnectionManager` is a cheap clone over one multiplexed connection
/// and reconnects on its own after the connection drops.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    commands: Arc<Commands>,
    clock: Clock,
}

impl RedisStore {
    /// Connect to `redis_url` and namespace all keys under `prefix`
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected job store to {} (prefix {})", redis_url, prefix);
        Ok(Self::from_connection(conn, prefix))
    }

    /// Use an existing connection, e.g. one shared with the host application
    pub fn from_connection(conn: ConnectionManager, prefix: &str) -> Self {
        RedisStore {
            conn,
            prefix: prefix.to_string(),
            commands: Arc::new(Commands::new()),
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys {
            base: format!("{}:{}", self.prefix, queue),
        }
    }

    async fn load_job(&self, keys: &QueueKeys, job_id: JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(keys.job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Job::from_fields(&fields).map(Some)
    }
}

fn parse_member(member: &str) -> Result<JobId> {
    member
        .parse()
        .map_err(|_| BullpenError::SerializationError(format!("invalid job member {}", member)))
}

#[async_trait]
impl JobStore for RedisStore {
    async fn enqueue(&self, queue: &str, payload: Value, options: &JobOptions) -> Result<JobId> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let id: JobId = conn.incr(keys.id(), 1).await?;
        let job = Job::new(id, queue, payload, options, self.clock.now());
        let fields = job.to_fields()?;

        redis::pipe()
            .atomic()
            .hset_multiple(keys.job(id), &fields)
            .ignore()
            .zadd(keys.ready(), pad_id(id), job.run_at)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!("Enqueued job {} on {} as {} (run_at {})", id, queue, job.state, job.run_at);
        Ok(id)
    }

    async fn lease(&self, queue: &str, worker_id: &str, lease_duration: Duration) -> Result<Option<Job>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let now = self.clock.now();
        let expires_at = now.saturating_add(lease_duration.as_millis() as u64);

        let fields: Option<HashMap<String, String>> = self
            .commands
            .lease
            .key(keys.ready())
            .key(keys.active())
            .arg(now)
            .arg(expires_at)
            .arg(worker_id)
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        match fields {
            Some(fields) => {
                let job = Job::from_fields(&fields)?;
                debug!("Worker {} leased job {} on {} until {}", worker_id, job.id, queue, expires_at);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, queue: &str, job_id: JobId, worker_id: &str) -> Result<bool> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let acked: i64 = self
            .commands
            .ack
            .key(keys.active())
            .key(keys.completed())
            .arg(pad_id(job_id))
            .arg(keys.job(job_id))
            .arg(self.clock.now())
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;

        Ok(acked == 1)
    }

    async fn fail(&self, queue: &str, job_id: JobId, worker_id: &str, error: &str) -> Result<Option<Job>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let fields: Option<HashMap<String, String>> = self
            .commands
            .fail
            .key(keys.active())
            .key(keys.ready())
            .key(keys.failed())
            .arg(pad_id(job_id))
            .arg(keys.job(job_id))
            .arg(self.clock.now())
            .arg(error)
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;

        fields.map(|fields| Job::from_fields(&fields)).transpose()
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<ReclaimReport> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let entries: Vec<String> = self
            .commands
            .reclaim
            .key(keys.active())
            .key(keys.ready())
            .key(keys.failed())
            .arg(self.clock.now())
            .arg(keys.job_prefix())
            .arg("Lease expired for job ")
            .invoke_async(&mut conn)
            .await?;

        let mut report = ReclaimReport::default();
        for entry in entries {
            match entry.split_once(':') {
                Some(("requeued", member)) => report.requeued.push(parse_member(member)?),
                Some(("failed", member)) => {
                    let job_id = parse_member(member)?;
                    if let Some(job) = self.load_job(&keys, job_id).await? {
                        if job.remove_on_fail {
                            conn.del::<_, ()>(keys.job(job_id)).await?;
                        }
                        report.failed.push(job);
                    }
                }
                _ => {
                    return Err(BullpenError::SerializationError(format!(
                        "unexpected reclaim entry {}",
                        entry
                    )))
                }
            }
        }
        Ok(report)
    }

    async fn promote_delayed(&self, queue: &str) -> Result<usize> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let promoted: usize = self
            .commands
            .promote
            .key(keys.ready())
            .arg(self.clock.now())
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        Ok(promoted)
    }

    async fn get_job(&self, queue: &str, job_id: JobId) -> Result<Option<Job>> {
        self.load_job(&self.keys(queue), job_id).await
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) = self
            .commands
            .counts
            .key(keys.ready())
            .key(keys.active())
            .key(keys.completed())
            .key(keys.failed())
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}
