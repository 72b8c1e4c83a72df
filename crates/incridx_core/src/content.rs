//! File content supplied by the host.
//!
//! The engine never reads files itself. A [`ContentSource`] hands out
//! [`FileContent`] on demand; its [`ContentKind`] tells the engine whether
//! the bytes are what is saved on disk or an unsaved, speculative state.

use crate::types::FileId;
use std::str::Utf8Error;
use std::sync::Arc;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Whether content reflects saved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// Content as persisted by the host; indexed into the on-disk tables.
    Persisted,
    /// Unsaved content; indexed into in-memory overlays only.
    Speculative,
}

/// The bytes of one file plus a stable fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    bytes: Arc<[u8]>,
    fingerprint: u64,
    kind: ContentKind,
}

impl FileContent {
    /// Creates persisted content, fingerprinting the bytes.
    #[must_use]
    pub fn persisted(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(bytes.into(), ContentKind::Persisted)
    }

    /// Creates speculative content, fingerprinting the bytes.
    #[must_use]
    pub fn speculative(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(bytes.into(), ContentKind::Speculative)
    }

    fn new(bytes: Vec<u8>, kind: ContentKind) -> Self {
        let fingerprint = fingerprint(&bytes);
        Self {
            bytes: bytes.into(),
            fingerprint,
            kind,
        }
    }

    /// Creates content with a fingerprint computed by the host.
    #[must_use]
    pub fn with_fingerprint(bytes: impl Into<Vec<u8>>, fingerprint: u64, kind: ContentKind) -> Self {
        Self {
            bytes: bytes.into().into(),
            fingerprint,
            kind,
        }
    }

    /// Raw bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes as UTF-8 text.
    pub fn text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.bytes)
    }

    /// Content fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Content kind.
    #[must_use]
    pub fn kind(&self) -> ContentKind {
        self.kind
    }
}

/// XXH3 64-bit hash of `bytes`.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Failure reported by a content source.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ContentError {
    message: String,
}

impl ContentError {
    /// Creates an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Supplies file content to the engine.
pub trait ContentSource: Send + Sync {
    /// Returns the current content of `file`, or `None` if it no longer exists.
    fn content(&self, file: FileId) -> Result<Option<FileContent>, ContentError>;
}
