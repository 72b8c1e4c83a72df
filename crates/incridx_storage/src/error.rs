//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The stored bytes are not what the reader expected.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    ///
    /// Only interrupted, would-block and timed-out I/O qualifies; everything
    /// else is treated as a hard failure by callers.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_io_is_transient() {
        let err = StorageError::Io(io::Error::new(io::ErrorKind::Interrupted, "signal"));
        assert!(err.is_transient());
    }

    #[test]
    fn corruption_is_not_transient() {
        assert!(!StorageError::Corrupted("bad crc".into()).is_transient());
        let err = StorageError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        assert!(!err.is_transient());
    }
}
