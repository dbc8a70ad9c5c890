//! Error types for prioq-rs.

use thiserror::Error;

use crate::worker::WorkerState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("priority {0} is outside the exact score range")]
    InvalidPriority(i64),

    #[error("invalid worker transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("callback failed: {0:#}")]
    Callback(anyhow::Error),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that retrying cannot fix. A worker loop stops on these
    /// instead of backing off.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidQueueName(_) | Error::Config(_) | Error::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
