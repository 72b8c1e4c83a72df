//! Per-index storage and the update transaction.

mod container;
mod definition;
mod forward;
mod instance;
mod inverted;
mod stamps;
mod update;

pub use container::{IdSet, ValueContainer};
pub use definition::IndexDefinition;
pub use forward::ForwardIndex;
pub use instance::FlushAttempt;
pub(crate) use instance::{IndexEnv, IndexHandle, IndexInstance};
pub use inverted::{IdFilter, InvertedStorage};
pub use stamps::{FileStamp, StampTable};
