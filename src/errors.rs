use thiserror::Error;

use crate::job::JobId;

/// Custom error types for Bullpen
#[derive(Error, Debug)]
pub enum BullpenError {
    /// The backing store could not be reached (connection refused, IO, timeout)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Any other error reported by Redis (script errors, wrong types, ...)
    #[error("Redis error: {0}")]
    RedisError(redis::RedisError),

    /// A handler is already bound to the queue
    #[error("Queue {0} already has a handler registered")]
    DuplicateHandler(String),

    /// Two queue definitions share the same name
    #[error("Queue {0} is defined more than once")]
    DuplicateQueue(String),

    /// A manifest refers to a handler the catalog does not contain
    #[error("Queue {queue} refers to unknown handler {handler}")]
    UnknownHandler { queue: String, handler: String },

    /// A job handler returned an error or panicked
    #[error("Handler error: {0}")]
    HandlerError(String),

    /// A lease ran out before the job was acked or failed
    #[error("Lease expired for job {0}")]
    LeaseExpired(JobId),

    /// The queue no longer accepts work
    #[error("Queue {0} is closed")]
    QueueClosed(String),

    /// Queue names become key namespaces and must be well formed
    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    /// Error while discovering queue manifests
    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    /// Unusable configuration value
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Error related to IO operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error related to serialization or deserialization
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Error when an invalid argument is provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl BullpenError {
    /// Whether the error comes from the transport rather than from a job
    pub fn is_store_error(&self) -> bool {
        matches!(self, BullpenError::StoreUnavailable(_) | BullpenError::RedisError(_))
    }
}

impl From<redis::RedisError> for BullpenError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            BullpenError::StoreUnavailable(err.to_string())
        } else {
            BullpenError::RedisError(err)
        }
    }
}

impl From<serde_json::Error> for BullpenError {
    fn from(err: serde_json::Error) -> Self {
        BullpenError::SerializationError(err.to_string())
    }
}

/// Result type for Bullpen operations
pub type Result<T> = std::result::Result<T, BullpenError>;
