//! Append-only key/value table logs.
//!
//! Every persistent table of an index (entries, forward, stamps) is a
//! [`LogMap`]: records are appended to a [`incridx_storage::StorageBackend`]
//! and an in-memory directory maps each live key to its latest record.

mod log_map;
mod record;

pub use log_map::{LogMap, TableLocation};
