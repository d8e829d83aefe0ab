//! Queue error types

use thiserror::Error;

use crate::io::IoError;

/// Queue operation errors
///
/// Clone because a single backend failure is broadcast to every flush
/// waiter attached to the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Backing device has no space left; latched preferentially over
    /// later errors so the first meaningful failure survives.
    #[error("no space left on backing device")]
    NoSpace,

    /// Any other backend IO failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Submission is paused after a handled error, awaiting resume
    #[error("queue paused after backend error")]
    Paused,

    /// The queue was shut down
    #[error("queue is shut down")]
    Shutdown,
}

impl QueueError {
    /// Whether this is the preferentially latched no-space condition
    pub fn is_no_space(&self) -> bool {
        matches!(self, QueueError::NoSpace)
    }
}

impl From<IoError> for QueueError {
    fn from(e: IoError) -> Self {
        if e.is_no_space() {
            QueueError::NoSpace
        } else {
            QueueError::Backend(e.to_string())
        }
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
