//! # incridx Testkit
//!
//! Test utilities for the incridx engine.
//!
//! This crate provides:
//! - Temporary engines, an in-memory content source and sample index definitions
//! - A manual clock for stamp and restart scenarios
//! - Property-based test generators using proptest
//! - Forward/inverted consistency checkers
//! - Concurrency stress helpers
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use incridx_testkit::prelude::*;
//!
//! #[test]
//! fn indexes_words() {
//!     let engine = TestEngine::new();
//!     engine.index_text(1, "hello world");
//!     assert_eq!(engine.files_of("hello"), vec![FileId::new(1)]);
//!     assert_consistent(&engine, &engine.words);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod consistency;
pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::consistency::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::stress::*;
    pub use incridx_core::{
        ChangeFlags, Config, CoreError, Engine, EngineBuilder, FileContent, FileId, IndexDefinition, IndexRef,
        ReadPolicy, RebuildOutcome, RebuildStatus, TaskContext, VersionDiff,
    };
}

pub use consistency::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use stress::*;
