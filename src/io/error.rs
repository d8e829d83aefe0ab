//! IO error types

use thiserror::Error;

/// Backend IO errors
#[derive(Error, Debug)]
pub enum IoError {
    /// Standard IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing device has no space left
    #[error("no space left on device")]
    NoSpace,
}

impl IoError {
    /// Whether this is the no-space condition.
    ///
    /// The queue latches no-space errors preferentially over later
    /// failures, so the first meaningful error survives.
    pub fn is_no_space(&self) -> bool {
        match self {
            IoError::NoSpace => true,
            IoError::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
        }
    }
}

/// Result type for IO operations
pub type IoResult<T> = Result<T, IoError>;
