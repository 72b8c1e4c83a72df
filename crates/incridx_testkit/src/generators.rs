//! Property-based test generators using proptest.
//!
//! Vocabularies and id ranges are deliberately small so random sequences
//! revisit the same files and keys often.

use incridx_core::{ChangeFlags, FileId};
use proptest::prelude::*;

/// One step of a random indexing history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    /// Index `text` as the new content of the file.
    Index(u32, String),
    /// Remove the file from every index.
    Remove(u32),
}

impl IndexOp {
    /// File the operation touches.
    pub fn file(&self) -> FileId {
        match self {
            Self::Index(file, _) | Self::Remove(file) => FileId::new(*file),
        }
    }
}

/// Strategy for file ids drawn from a small range.
pub fn file_id_strategy() -> impl Strategy<Value = u32> {
    1u32..12
}

/// Strategy for words drawn from a small vocabulary.
pub fn word_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-f]{1,2}").expect("Invalid regex")
}

/// Strategy for documents of up to eight words, repeats allowed.
pub fn document_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(word_strategy(), 0..8).prop_map(|words| words.join(" "))
}

/// Strategy for a single operation, weighted towards indexing.
pub fn index_op_strategy() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        4 => (file_id_strategy(), document_strategy()).prop_map(|(file, text)| IndexOp::Index(file, text)),
        1 => file_id_strategy().prop_map(IndexOp::Remove),
    ]
}

/// Strategy for operation sequences of up to `max_len` steps.
pub fn index_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<IndexOp>> {
    prop::collection::vec(index_op_strategy(), 1..max_len.max(2))
}

/// Strategy for non-empty change flag sets.
pub fn change_flags_strategy() -> impl Strategy<Value = ChangeFlags> {
    (1u8..32).prop_map(ChangeFlags::from_bits_truncate)
}
