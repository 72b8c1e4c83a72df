//! # incridx Core
//!
//! Incremental inverted-index engine.
//!
//! This crate provides:
//! - Per-index inverted (key → value → files) and forward (file → keys) tables
//! - The diff-based update transaction that keeps both tables consistent
//! - Version tracking with monotonic creation stamps and per-index rebuilds
//! - Change tracking with durable dirty-file queues
//! - A buffering gate for speculative, never-persisted content
//! - A background flusher that never blocks on index locks

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffering;
mod cancel;
mod changes;
mod codec;
mod config;
mod content;
mod dir;
mod engine;
mod error;
mod flusher;
mod index;
mod manifest;
mod rebuild;
mod registry;
mod stats;
mod table;
mod types;
mod version;

pub use buffering::{BufferMode, BufferingGate, BufferingGuard};
pub use cancel::{ActiveMarker, CancellationToken, Cancelled, TaskContext};
pub use changes::{ChangeFlags, ChangeInfo, EventMerger, PartitionRecovery};
pub use codec::{Cbor, IndexKey, IndexValue};
pub use config::{Config, StorageExtension};
pub use content::{fingerprint, ContentError, ContentKind, ContentSource, FileContent};
pub use engine::{Engine, EngineBuilder, ProcessReport};
pub use error::{CoreError, CoreResult};
pub use flusher::RoundReport;
pub use index::{FlushAttempt, IdFilter, IdSet, IndexDefinition, ValueContainer};
pub use rebuild::{IndexEventListener, ReadPolicy, RebuildOutcome, RebuildState, RebuildStatus};
pub use registry::IndexRef;
pub use stats::{EngineStats, StatsSnapshot};
pub use types::{FileId, IndexId, IndexingStamp};
pub use version::{Clock, IndexVersion, SystemClock, VersionDiff};
