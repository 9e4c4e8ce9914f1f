//! Error types for batchtrack.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("store throttled or unavailable: {0}")]
    TransientStore(String),

    #[error("store retries exhausted with {unprocessed} item(s) unwritten: {message}")]
    StoreExhausted { unprocessed: usize, message: String },

    #[error("job submission failed for group {group}: {message}")]
    Submission { group: String, message: String },

    #[error("worker step failed: {0}")]
    WorkerExecution(String),

    #[error("invalid claim transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientStore(_) => true,
            Error::Database(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
