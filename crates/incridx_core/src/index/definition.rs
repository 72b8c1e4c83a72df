//! Index definitions supplied by the host.

use crate::codec::{IndexKey, IndexValue};
use crate::content::FileContent;
use std::collections::HashMap;

/// A named mapping from file content to keys and values.
///
/// The mapping must be a pure function of the content: indexing the same
/// content twice has to yield the same map, otherwise incremental updates
/// and full rebuilds would disagree.
///
/// # Example
///
/// ```rust
/// use incridx_core::{FileContent, IndexDefinition};
/// use std::collections::HashMap;
///
/// /// Maps every word to the number of times it occurs.
/// struct WordCount;
///
/// impl IndexDefinition for WordCount {
///     type Key = String;
///     type Value = u32;
///
///     fn name(&self) -> &str {
///         "word-count"
///     }
///
///     fn version(&self) -> u32 {
///         1
///     }
///
///     fn map(&self, content: &FileContent) -> HashMap<String, u32> {
///         let mut counts = HashMap::new();
///         for word in content.text().unwrap_or_default().split_whitespace() {
///             *counts.entry(word.to_string()).or_insert(0) += 1;
///         }
///         counts
///     }
/// }
/// ```
pub trait IndexDefinition: Send + Sync + 'static {
    /// Key type of the inverted table.
    type Key: IndexKey;
    /// Value type stored per (key, file).
    type Value: IndexValue;

    /// Restart-stable, unique index name.
    fn name(&self) -> &str;

    /// Schema version. Changing it wipes and rebuilds the index.
    fn version(&self) -> u32;

    /// Input filter. Rejected files contribute nothing to the index.
    fn accepts(&self, _content: &FileContent) -> bool {
        true
    }

    /// Maps content to its keys and values.
    fn map(&self, content: &FileContent) -> HashMap<Self::Key, Self::Value>;
}
