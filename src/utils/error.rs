//! The `error` module defines the error type shared by every component of
//! `msgrelay`.
//!
//! Each failure class of the delivery pipeline is its own variant, so callers
//! can branch on [`RelayError::kind`] instead of matching on message text:
//!
//! - connection failures are retried by the supervisor, then become fatal
//! - publish failures are surfaced to whoever asked for the publish
//! - decode, processing and sink I/O failures leave the message to the broker
//!   for redelivery

use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// A single attempt to reach the broker failed, or an open connection
    /// was lost. Transient.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The supervisor ran out of connection attempts.
    #[error("giving up after {attempts} connection attempts: {last_error}")]
    FatalConnection { attempts: u32, last_error: String },

    #[error("publish to queue '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },

    /// The queue already exists with different arguments (for example a
    /// different durability flag).
    #[error("queue '{queue}' conflicts with an existing declaration: {reason}")]
    QueueConflict { queue: String, reason: String },

    #[error("malformed message payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message processing failed: {0}")]
    Processing(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Plain tag for each [`RelayError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    FatalConnection,
    Publish,
    QueueConflict,
    Decode,
    Io,
    Processing,
    Config,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Connection(_) => ErrorKind::Connection,
            RelayError::FatalConnection { .. } => ErrorKind::FatalConnection,
            RelayError::Publish { .. } => ErrorKind::Publish,
            RelayError::QueueConflict { .. } => ErrorKind::QueueConflict,
            RelayError::Decode(_) => ErrorKind::Decode,
            RelayError::Io(_) => ErrorKind::Io,
            RelayError::Processing(_) => ErrorKind::Processing,
            RelayError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only connection-class failures are eligible for retry.
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Wraps any failure on the publish path into a `Publish` error for
    /// `queue`, keeping the underlying text.
    pub fn into_publish(self, queue: &str) -> RelayError {
        match self {
            RelayError::Publish { .. } => self,
            other => RelayError::Publish {
                queue: queue.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
