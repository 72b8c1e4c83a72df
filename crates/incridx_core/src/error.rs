//! Error types for the incridx engine.

use crate::cancel::Cancelled;
use crate::rebuild::RebuildStatus;
use crate::types::FileId;
use crate::version::VersionDiff;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] incridx_storage::StorageError),

    /// I/O error outside a storage backend (directories, lock file, queues).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted record of an index is malformed.
    #[error("storage corruption in index {index}: {message}")]
    StorageCorruption {
        /// Index whose data is corrupted.
        index: String,
        /// Description of the corruption.
        message: String,
    },

    /// The persisted version of an index differs from the declared one.
    #[error("version mismatch in index {index}: {diff:?}")]
    VersionMismatch {
        /// Index whose version drifted.
        index: String,
        /// Outcome of the version comparison.
        diff: VersionDiff,
    },

    /// Forward and inverted tables disagree about a file.
    #[error("consistency violation in index {index} for {file}: {message}")]
    ConsistencyViolation {
        /// Index where the mismatch was detected.
        index: String,
        /// File whose associations disagree.
        file: FileId,
        /// Description of the mismatch.
        message: String,
    },

    /// The index is being rebuilt; the caller should retry later.
    #[error("index {index} is not ready ({status:?}), retry later")]
    IndexNotReady {
        /// Index that is not ready.
        index: String,
        /// Its current rebuild status.
        status: RebuildStatus,
    },

    /// The operation observed a cancellation request.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// The task tried to re-enter an index it is already inside.
    #[error("reentrant access to index {index} from a task already inside it")]
    Reentrant {
        /// Index that was re-entered.
        index: String,
    },

    /// No partition is open under this name.
    #[error("unknown partition: {name}")]
    UnknownPartition {
        /// Requested partition name.
        name: String,
    },

    /// No index is registered under this name.
    #[error("unknown index: {name}")]
    UnknownIndex {
        /// Requested index name.
        name: String,
    },

    /// Two definitions were registered under the same name.
    #[error("duplicate index: {name}")]
    DuplicateIndex {
        /// Conflicting index name.
        name: String,
    },

    /// A typed handle was used with an index of different key/value types.
    #[error("index {name} was registered with different key/value types")]
    IndexTypeMismatch {
        /// Index name.
        name: String,
    },

    /// Another process holds the engine root.
    #[error("engine locked: another process has exclusive access")]
    EngineLocked,

    /// The engine has been closed.
    #[error("engine is closed")]
    EngineClosed,

    /// A file outside the index tables has an invalid format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The content source failed to produce a file's content.
    #[error("content of {file} unavailable: {message}")]
    Content {
        /// File whose content was requested.
        file: FileId,
        /// Reason reported by the content source.
        message: String,
    },
}

impl CoreError {
    /// Creates a storage corruption error.
    pub fn corruption(index: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageCorruption {
            index: index.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an index-not-ready error.
    pub fn not_ready(index: impl Into<String>, status: RebuildStatus) -> Self {
        Self::IndexNotReady {
            index: index.into(),
            status,
        }
    }

    /// Returns true for I/O failures worth one retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns true if this error means the index data can no longer be trusted.
    ///
    /// Such errors are converted into a rebuild request at the transaction
    /// boundary instead of reaching query callers.
    #[must_use]
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Io(_)
                | Self::StorageCorruption { .. }
                | Self::VersionMismatch { .. }
                | Self::ConsistencyViolation { .. }
                | Self::InvalidFormat { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use incridx_storage::StorageError;

    #[test]
    fn transient_classification() {
        let transient = CoreError::Storage(StorageError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "slow disk",
        )));
        assert!(transient.is_transient());
        assert!(transient.requires_rebuild());

        let corrupt = CoreError::corruption("words", "bad crc");
        assert!(!corrupt.is_transient());
        assert!(corrupt.requires_rebuild());
    }

    #[test]
    fn control_errors_do_not_trigger_rebuild() {
        assert!(!CoreError::Cancelled(Cancelled).requires_rebuild());
        assert!(!CoreError::not_ready("words", RebuildStatus::RebuildInProgress).requires_rebuild());
        assert!(!CoreError::Reentrant {
            index: "words".into()
        }
        .requires_rebuild());
    }

    #[test]
    fn messages_name_the_index() {
        let err = CoreError::not_ready("words", RebuildStatus::RequiresRebuild);
        assert!(err.to_string().contains("words"));
    }
}
