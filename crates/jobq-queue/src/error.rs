use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the queue subsystem.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed dispatch or operator arguments. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No handler is registered for the job type.
    #[error("no handler for type {job_type}")]
    HandlerNotFound { job_type: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value the queue cannot decode.
    #[error("Corrupt job row: {0}")]
    Corrupt(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job is being executed and cannot be touched by an operator.
    #[error("Job is processing: {id}")]
    JobProcessing { id: String },

    /// The operation is not valid for the job's current status.
    #[error("Job {id} is {status}")]
    InvalidState { id: String, status: JobStatus },
}

impl QueueError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        QueueError::Validation(msg.into())
    }

    /// Short error code string used by operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "VALIDATION_ERROR",
            QueueError::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            QueueError::Database(_) => "DATABASE_ERROR",
            QueueError::Serialization(_) => "SERIALIZATION_ERROR",
            QueueError::Corrupt(_) => "CORRUPT_ROW",
            QueueError::JobNotFound { .. } => "JOB_NOT_FOUND",
            QueueError::JobProcessing { .. } => "JOB_PROCESSING",
            QueueError::InvalidState { .. } => "INVALID_STATE",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Failure reported by a [`JobHandler`](crate::registry::JobHandler).
///
/// Absorbed into the job's `error_message`; never surfaced to the worker loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        Self::new(format!("{err:#}"))
    }
}
