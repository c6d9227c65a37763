use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::{BackoffOptions, BackoffStrategy};
use crate::errors::BullpenError;

/// Job identifier, monotonic per queue
pub type JobId = u64;

/// Job state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Completed and failed jobs never move again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job options for creating a new job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Optional delay in milliseconds
    pub delay: Option<u64>,
    /// Optional absolute due time in milliseconds since epoch, wins over `delay`
    pub run_at: Option<u64>,
    /// Optional attempts before job fails
    pub attempts: Option<u32>,
    /// Optional backoff strategy
    pub backoff: Option<BackoffOptions>,
    /// Drop the job from the store once it completes
    pub remove_on_complete: Option<bool>,
    /// Drop the job from the store once it fails for good
    pub remove_on_fail: Option<bool>,
}

impl JobOptions {
    pub fn delayed(delay: u64) -> Self {
        JobOptions {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn at(run_at: u64) -> Self {
        JobOptions {
            run_at: Some(run_at),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn with_remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    /// Fill unset fields from queue level defaults
    pub fn merged_with(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            delay: self.delay.or(defaults.delay),
            run_at: self.run_at.or(defaults.run_at),
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.or(defaults.backoff),
            remove_on_complete: self.remove_on_complete.or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.or(defaults.remove_on_fail),
        }
    }
}

/// Exclusive claim on an active job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker that holds the lease
    pub owner: String,
    /// Expiry in milliseconds since epoch
    pub expires_at: u64,
}

/// Job record as held by a job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID, unique within its queue
    pub id: JobId,
    /// Queue name this job belongs to
    pub queue_name: String,
    /// Job data
    pub data: Value,
    /// Current state of the job
    pub state: JobState,
    /// Number of failed attempts so far
    pub attempts_made: u32,
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Number of leases that ran out without ack or fail
    pub lease_expirations: u32,
    /// Time from which the job may be leased
    pub run_at: u64,
    /// Job creation timestamp in milliseconds since epoch
    pub created_at: u64,
    /// Last state change in milliseconds since epoch
    pub updated_at: u64,
    /// Error of the last failed attempt
    pub last_error: Option<String>,
    /// Current lease while active
    pub lease: Option<Lease>,
    /// Retry policy
    pub backoff: BackoffOptions,
    /// Completed job is deleted instead of kept
    pub remove_on_complete: bool,
    /// Failed job is deleted instead of kept
    pub remove_on_fail: bool,
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

impl Job {
    /// Create a new job
    pub fn new(id: JobId, queue_name: &str, data: Value, opts: &JobOptions, now: u64) -> Self {
        let run_at = match (opts.run_at, opts.delay) {
            (Some(run_at), _) => run_at,
            (None, Some(delay)) => now.saturating_add(delay),
            (None, None) => now,
        };
        let state = if run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Job {
            id,
            queue_name: queue_name.to_string(),
            data,
            state,
            attempts_made: 0,
            max_attempts: opts.attempts.unwrap_or(1).max(1),
            lease_expirations: 0,
            run_at,
            created_at: now,
            updated_at: now,
            last_error: None,
            lease: None,
            backoff: opts.backoff.unwrap_or_default(),
            remove_on_complete: opts.remove_on_complete.unwrap_or(false),
            remove_on_fail: opts.remove_on_fail.unwrap_or(false),
        }
    }

    /// Whether `lease` may pick this job at `now`
    pub fn is_eligible(&self, now: u64) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.run_at <= now
    }

    /// Whether `owner` holds the current lease of this active job
    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.state == JobState::Active && self.lease.as_ref().map_or(false, |lease| lease.owner == owner)
    }

    /// Delayed -> waiting once due
    pub fn promote(&mut self, now: u64) -> bool {
        if self.state == JobState::Delayed && self.run_at <= now {
            self.state = JobState::Waiting;
            self.updated_at = now;
            true
        } else {
            false
        }
    }

    /// Waiting/delayed -> active
    pub fn activate(&mut self, owner: &str, expires_at: u64, now: u64) {
        self.state = JobState::Active;
        self.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at,
        });
        self.updated_at = now;
    }

    /// Active -> completed; false if the job was not active
    pub fn complete(&mut self, now: u64) -> bool {
        if self.state != JobState::Active {
            return false;
        }
        self.state = JobState::Completed;
        self.lease = None;
        self.updated_at = now;
        true
    }

    /// Active -> waiting (retry with backoff) or failed; false if the job was not active
    pub fn fail(&mut self, error: &str, now: u64) -> bool {
        if self.state != JobState::Active {
            return false;
        }
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());
        self.lease = None;
        self.updated_at = now;

        if self.attempts_made >= self.max_attempts {
            self.state = JobState::Failed;
        } else {
            self.state = JobState::Waiting;
            self.run_at = now.saturating_add(self.backoff.delay_for(self.attempts_made));
        }
        true
    }

    /// Active job whose lease ran out goes back to waiting, attempts untouched.
    /// Returns true when the job failed for expiring too often.
    pub fn expire_lease(&mut self, now: u64) -> bool {
        self.lease_expirations += 1;
        self.lease = None;
        self.updated_at = now;

        if self.lease_expirations > self.max_attempts {
            self.state = JobState::Failed;
            self.last_error = Some(BullpenError::LeaseExpired(self.id).to_string());
            true
        } else {
            self.state = JobState::Waiting;
            false
        }
    }

    /// Flatten the job into Redis hash fields
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, BullpenError> {
        let mut fields = vec![
            ("id", self.id.to_string()),
            ("queue", self.queue_name.clone()),
            ("data", serde_json::to_string(&self.data)?),
            ("state", self.state.as_str().to_string()),
            ("attempts_made", self.attempts_made.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("lease_expirations", self.lease_expirations.to_string()),
            ("run_at", self.run_at.to_string()),
            ("created_at", self.created_at.to_string()),
            ("updated_at", self.updated_at.to_string()),
            ("backoff_strategy", self.backoff.strategy.as_str().to_string()),
            ("backoff_delay", self.backoff.delay.to_string()),
            ("backoff_cap", self.backoff.cap.to_string()),
            ("remove_on_complete", flag(self.remove_on_complete)),
            ("remove_on_fail", flag(self.remove_on_fail)),
        ];
        if let Some(error) = &self.last_error {
            fields.push(("last_error", error.clone()));
        }
        if let Some(lease) = &self.lease {
            fields.push(("lease_owner", lease.owner.clone()));
            fields.push(("lease_expires_at", lease.expires_at.to_string()));
        }
        Ok(fields)
    }

    /// Rebuild a job from Redis hash fields
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, BullpenError> {
        fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, BullpenError> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| BullpenError::SerializationError(format!("missing job field {}", name)))
        }

        fn number<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T, BullpenError> {
            field(fields, name)?
                .parse()
                .map_err(|_| BullpenError::SerializationError(format!("invalid job field {}", name)))
        }

        let state = field(fields, "state")?;
        let strategy = field(fields, "backoff_strategy")?;
        let lease = match fields.get("lease_owner") {
            Some(owner) if !owner.is_empty() => Some(Lease {
                owner: owner.clone(),
                expires_at: number(fields, "lease_expires_at")?,
            }),
            _ => None,
        };

        Ok(Job {
            id: number(fields, "id")?,
            queue_name: field(fields, "queue")?.to_string(),
            data: serde_json::from_str(field(fields, "data")?)?,
            state: JobState::parse(state)
                .ok_or_else(|| BullpenError::SerializationError(format!("unknown job state {}", state)))?,
            attempts_made: number(fields, "attempts_made")?,
            max_attempts: number(fields, "max_attempts")?,
            lease_expirations: number(fields, "lease_expirations")?,
            run_at: number(fields, "run_at")?,
            created_at: number(fields, "created_at")?,
            updated_at: number(fields, "updated_at")?,
            last_error: fields.get("last_error").filter(|e| !e.is_empty()).cloned(),
            lease,
            backoff: BackoffOptions {
                strategy: BackoffStrategy::parse(strategy)
                    .ok_or_else(|| BullpenError::SerializationError(format!("unknown backoff strategy {}", strategy)))?,
                delay: number(fields, "backoff_delay")?,
                cap: number(fields, "backoff_cap")?,
            },
            remove_on_complete: fields.get("remove_on_complete").map_or(false, |v| v == "1"),
            remove_on_fail: fields.get("remove_on_fail").map_or(false, |v| v == "1"),
        })
    }
}
