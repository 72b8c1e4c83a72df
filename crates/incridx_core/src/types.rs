//! Core type definitions for incridx.

use std::fmt;
use std::sync::Arc;

/// Opaque identifier of a file, assigned by the content source.
///
/// File ids are stable for the lifetime of a file and may be reused when a
/// file is re-created at the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl FileId {
    /// Creates a new file ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// Globally unique, restart-stable name of an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(Arc<str>);

impl IndexId {
    /// Creates an index ID from its name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// Returns the index name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw stamp value meaning "never indexed".
pub const UNINDEXED_STAMP: i64 = 0;

/// Raw stamp value written by explicit invalidation.
pub const OUTDATED_STAMP: i64 = -1;

/// Indexing state of one file for one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingStamp {
    /// The file was never indexed (or was removed).
    Unindexed,
    /// The file was indexed under an older version, or invalidated.
    Outdated,
    /// The file was indexed under the index's current creation stamp.
    UpToDate,
}

impl IndexingStamp {
    /// Classifies a raw stored stamp against the index's current creation stamp.
    #[must_use]
    pub fn classify(raw: i64, current: i64) -> Self {
        if raw == UNINDEXED_STAMP {
            Self::Unindexed
        } else if raw == current {
            Self::UpToDate
        } else {
            Self::Outdated
        }
    }
}
