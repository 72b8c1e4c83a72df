//! # incridx storage
//!
//! Byte-store backends for the incridx index engine.
//!
//! Backends are **opaque byte stores**: they append, read back, flush and
//! truncate. The table logs, version records and dirty-file queues built on
//! top of them live in `incridx_core`; nothing here understands those formats.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - persistent storage using positional OS file reads
//! - [`InMemoryBackend`] - ephemeral storage with optional fault injection
//!
//! ## Example
//!
//! ```rust
//! use incridx_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"postings").unwrap();
//! assert_eq!(backend.read_at(offset, 8).unwrap(), b"postings");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::{FaultKind, InMemoryBackend};
