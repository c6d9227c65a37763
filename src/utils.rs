use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::errors::BullpenError;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Time source used by the job stores
#[derive(Debug, Clone, Default)]
pub enum Clock {
    /// Wall clock
    #[default]
    System,
    /// Manually driven clock, shared between clones
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// Create a manual clock starting at `start` milliseconds
    pub fn manual(start: u64) -> Self {
        Clock::Manual(Arc::new(AtomicU64::new(start)))
    }

    /// Current time in milliseconds
    pub fn now(&self) -> u64 {
        match self {
            Clock::System => now_millis(),
            Clock::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock forward. No-op for the system clock.
    pub fn advance(&self, millis: u64) {
        if let Clock::Manual(ms) = self {
            ms.fetch_add(millis, Ordering::SeqCst);
        }
    }
}

/// Validate a queue name; names are used verbatim inside store keys
pub fn validate_queue_name(name: &str) -> Result<(), BullpenError> {
    lazy_static::lazy_static! {
        static ref QUEUE_NAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_.:-]+$").unwrap();
    }

    if QUEUE_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(BullpenError::InvalidQueueName(name.to_string()))
    }
}

/// Zero-padded form of a job id so that lexical order equals numeric order
pub fn pad_id(id: u64) -> String {
    format!("{:020}", id)
}
