//! Pipeline error taxonomy
//!
//! Every stage boundary converts failures into one of three categories:
//! ignorable (log and complete), retryable (reschedule with backoff), or
//! fatal-to-task (route to the error channel with the original payload).
//! Stage-local errors never cross stage boundaries as raw errors.

use thiserror::Error;

/// Result type for stage handlers and engine operations
pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Categorized task failure
#[derive(Debug, Error)]
pub enum TaskError {
    /// Not-found / ambiguous / unmatched / unchanged. The task completes
    /// with no downstream effect.
    #[error("Ignorable: {0}")]
    Ignorable(String),

    /// Transient network or remote-5xx failure; reschedule with backoff.
    #[error("Retryable: {0}")]
    Retryable(String),

    /// Malformed payload or broken expectation; route to the error
    /// channel, never silently drop.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }

    pub fn is_ignorable(&self) -> bool {
        matches!(self, TaskError::Ignorable(_))
    }
}

impl From<claimtrail_common::Error> for TaskError {
    fn from(err: claimtrail_common::Error) -> Self {
        match err {
            claimtrail_common::Error::NotFound(msg) => TaskError::Ignorable(msg),
            claimtrail_common::Error::Database(e) => TaskError::Fatal(format!("database: {}", e)),
            other => TaskError::Fatal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::Fatal(format!("database: {}", err))
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            TaskError::Retryable(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                TaskError::Retryable(err.to_string())
            } else {
                TaskError::Fatal(err.to_string())
            }
        } else {
            TaskError::Retryable(err.to_string())
        }
    }
}
