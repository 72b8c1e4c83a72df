//! Change event merging.

use crate::types::FileId;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Kinds of change observed for a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeFlags: u8 {
        /// The file appeared.
        const ADDED = 1 << 0;
        /// The file disappeared.
        const REMOVED = 1 << 1;
        /// The file's content changed.
        const CONTENT_CHANGED = 1 << 2;
        /// The file's content is about to change.
        const BEFORE_CONTENT_CHANGED = 1 << 3;
        /// Something other than the content changed (e.g. file type or encoding).
        const TRANSIENT_STATE_CHANGED = 1 << 4;
    }
}

impl ChangeFlags {
    /// Merges a later event into this one.
    ///
    /// A removal discards everything recorded before it. Any later event is
    /// OR-ed in, so a re-creation after a removal keeps both bits.
    #[must_use]
    pub fn merge(self, later: Self) -> Self {
        if later.contains(Self::REMOVED) {
            later
        } else {
            self | later
        }
    }
}

/// Net pending change of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeInfo {
    /// Changed file.
    pub file: FileId,
    /// Merged flags.
    pub flags: ChangeFlags,
    /// Arrival order of the first event merged into this one.
    pub ordinal: u64,
}

const SHARDS: usize = 16;

/// Collapses a stream of events into one [`ChangeInfo`] per file.
#[derive(Debug)]
pub struct EventMerger {
    shards: Vec<Mutex<HashMap<FileId, ChangeInfo>>>,
    next_ordinal: AtomicU64,
}

impl Default for EventMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMerger {
    /// Creates an empty merger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            next_ordinal: AtomicU64::new(0),
        }
    }

    fn shard(&self, file: FileId) -> &Mutex<HashMap<FileId, ChangeInfo>> {
        &self.shards[file.as_u32() as usize % SHARDS]
    }

    /// Merges `flags` into the pending change of `file`.
    pub fn record(&self, file: FileId, flags: ChangeFlags) {
        let mut shard = self.shard(file).lock();
        match shard.get_mut(&file) {
            Some(info) => info.flags = info.flags.merge(flags),
            None => {
                let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
                shard.insert(
                    file,
                    ChangeInfo {
                        file,
                        flags,
                        ordinal,
                    },
                );
            }
        }
    }

    /// Puts back a drained change that could not be applied.
    ///
    /// The restored change is older than anything recorded since the drain,
    /// so it is merged underneath the pending flags and keeps its ordinal.
    pub fn restore(&self, info: ChangeInfo) {
        let mut shard = self.shard(info.file).lock();
        match shard.get_mut(&info.file) {
            Some(pending) => {
                pending.flags = info.flags.merge(pending.flags);
                pending.ordinal = pending.ordinal.min(info.ordinal);
            }
            None => {
                shard.insert(info.file, info);
            }
        }
    }

    /// Returns the pending change of `file`.
    #[must_use]
    pub fn get(&self, file: FileId) -> Option<ChangeInfo> {
        self.shard(file).lock().get(&file).copied()
    }

    /// Drops the pending change of `file`.
    pub fn forget(&self, file: FileId) -> Option<ChangeInfo> {
        self.shard(file).lock().remove(&file)
    }

    /// Number of files with pending changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every pending change in arrival order.
    ///
    /// Keys are removed one at a time, so an event recorded for a file after
    /// its entry was taken starts a new pending entry instead of being lost.
    pub fn drain(&self) -> Vec<ChangeInfo> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let files: Vec<FileId> = shard.lock().keys().copied().collect();
            for file in files {
                if let Some(info) = shard.lock().remove(&file) {
                    drained.push(info);
                }
            }
        }
        drained.sort_by_key(|info| info.ordinal);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn content_change_then_remove_is_remove() {
        let merger = EventMerger::new();
        merger.record(FileId(1), ChangeFlags::CONTENT_CHANGED);
        merger.record(FileId(1), ChangeFlags::REMOVED);
        assert_eq!(merger.get(FileId(1)).unwrap().flags, ChangeFlags::REMOVED);
    }

    #[test]
    fn add_after_remove_keeps_both() {
        let merger = EventMerger::new();
        merger.record(FileId(1), ChangeFlags::CONTENT_CHANGED);
        merger.record(FileId(1), ChangeFlags::REMOVED);
        merger.record(FileId(1), ChangeFlags::ADDED);
        assert_eq!(
            merger.get(FileId(1)).unwrap().flags,
            ChangeFlags::REMOVED | ChangeFlags::ADDED
        );
    }

    #[test]
    fn drain_returns_arrival_order_and_empties() {
        let merger = EventMerger::new();
        for id in [40, 3, 17] {
            merger.record(FileId(id), ChangeFlags::ADDED);
        }
        merger.record(FileId(3), ChangeFlags::CONTENT_CHANGED);

        let drained = merger.drain();
        let files: Vec<_> = drained.iter().map(|info| info.file).collect();
        assert_eq!(files, vec![FileId(40), FileId(3), FileId(17)]);
        assert_eq!(
            drained[1].flags,
            ChangeFlags::ADDED | ChangeFlags::CONTENT_CHANGED
        );
        assert!(merger.is_empty());
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let merger = std::sync::Arc::new(EventMerger::new());
        let writer = {
            let merger = std::sync::Arc::clone(&merger);
            std::thread::spawn(move || {
                for id in 0..10_000 {
                    merger.record(FileId(id), ChangeFlags::CONTENT_CHANGED);
                }
            })
        };

        let mut seen = std::collections::HashSet::new();
        while !writer.is_finished() {
            seen.extend(merger.drain().into_iter().map(|info| info.file));
        }
        writer.join().unwrap();
        seen.extend(merger.drain().into_iter().map(|info| info.file));
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn restored_removal_keeps_later_addition() {
        let merger = EventMerger::new();
        merger.record(FileId(4), ChangeFlags::REMOVED);
        let drained = merger.drain();
        merger.record(FileId(4), ChangeFlags::ADDED);

        merger.restore(drained[0]);
        let info = merger.get(FileId(4)).unwrap();
        assert_eq!(info.flags, ChangeFlags::REMOVED | ChangeFlags::ADDED);
        assert_eq!(info.ordinal, drained[0].ordinal);
    }

    #[test]
    fn restored_change_is_overridden_by_later_removal() {
        let merger = EventMerger::new();
        merger.record(FileId(2), ChangeFlags::CONTENT_CHANGED);
        let drained = merger.drain();
        merger.record(FileId(2), ChangeFlags::REMOVED);

        merger.restore(drained[0]);
        assert_eq!(merger.get(FileId(2)).unwrap().flags, ChangeFlags::REMOVED);
    }

    #[test]
    fn restore_without_pending_change_reinserts() {
        let merger = EventMerger::new();
        merger.record(FileId(1), ChangeFlags::ADDED);
        merger.record(FileId(3), ChangeFlags::ADDED);
        let drained = merger.drain();

        merger.record(FileId(9), ChangeFlags::ADDED);
        merger.restore(drained[1]);
        merger.restore(drained[0]);
        let order: Vec<FileId> = merger.drain().into_iter().map(|info| info.file).collect();
        assert_eq!(order, vec![FileId(1), FileId(3), FileId(9)]);
    }

    fn flags() -> impl Strategy<Value = ChangeFlags> {
        (0u8..32).prop_map(ChangeFlags::from_bits_truncate)
    }

    proptest! {
        #[test]
        fn remove_wins_over_everything_before(before in prop::collection::vec(flags(), 0..8), after in prop::collection::vec(flags().prop_map(|f| f - ChangeFlags::REMOVED), 0..8)) {
            let merger = EventMerger::new();
            for f in &before {
                merger.record(FileId(1), *f);
            }
            merger.record(FileId(1), ChangeFlags::REMOVED);
            for f in &after {
                merger.record(FileId(1), *f);
            }

            let expected = after.iter().fold(ChangeFlags::REMOVED, |acc, f| acc | *f);
            prop_assert_eq!(merger.get(FileId(1)).unwrap().flags, expected);
        }
    }
}
