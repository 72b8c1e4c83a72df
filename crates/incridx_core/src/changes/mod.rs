//! Change tracking.
//!
//! Raw file events are merged per file by the [`EventMerger`]; every file
//! with a pending or failed change stays in the [`DirtyFileSet`] until an
//! indexing pass handles it. Dirty files survive restarts through
//! per-partition queues and the orphan queue.

mod dirty;
mod merger;

pub use dirty::{DirtyFileSet, OrphanQueue, PartitionQueue, QueueMark};
pub use merger::{ChangeFlags, ChangeInfo, EventMerger};

use crate::dir::{validate_name, EngineDir};
use crate::error::{CoreError, CoreResult};
use crate::types::FileId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Shares its queue file name with the orphan queue.
const ORPHAN_PARTITION: &str = "orphans";

/// What a reopened partition must re-examine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecovery {
    /// Files that were dirty when the partition was last closed, plus
    /// orphans recorded since. They are already queued for re-indexing.
    pub dirty: Vec<FileId>,
    /// The saved state is missing or incomplete; the host should rescan
    /// every file of the partition.
    pub full_rescan_required: bool,
}

/// Event merger, dirty set and durable queues of one engine.
#[derive(Debug)]
pub struct ChangeTracker {
    dir: Arc<EngineDir>,
    merger: EventMerger,
    dirty: DirtyFileSet,
    partitions: Mutex<HashMap<String, HashSet<FileId>>>,
    orphans: Mutex<OrphanQueue>,
}

impl ChangeTracker {
    /// Opens the tracker, loading the orphan queue.
    pub fn open(dir: Arc<EngineDir>, orphan_queue_max_size: usize, generation: i64) -> CoreResult<Self> {
        let orphans = OrphanQueue::load(&dir.orphan_queue_path(), orphan_queue_max_size, generation)?;
        Ok(Self {
            dir,
            merger: EventMerger::new(),
            dirty: DirtyFileSet::new(),
            partitions: Mutex::new(HashMap::new()),
            orphans: Mutex::new(orphans),
        })
    }

    /// Records an event and marks the file dirty.
    pub fn record_event(&self, file: FileId, flags: ChangeFlags) {
        self.merger.record(file, flags);
        self.dirty.mark(file);
    }

    /// Removes and returns all pending changes.
    pub fn drain(&self) -> Vec<ChangeInfo> {
        let drained = self.merger.drain();
        if !drained.is_empty() {
            debug!(changes = drained.len(), "drained change events");
        }
        drained
    }

    /// Clears the dirty mark of a file whose change was applied, unless a new
    /// event for it arrived meanwhile.
    ///
    /// Events are recorded before the file is marked, so unmarking first and
    /// then re-checking the merger cannot lose a concurrent event.
    pub fn complete(&self, file: FileId) {
        self.dirty.unmark(file);
        if self.merger.get(file).is_some() {
            self.dirty.mark(file);
        }
    }

    /// Puts back a change that could not be applied, underneath any event
    /// recorded for the file since it was drained.
    pub fn requeue(&self, info: ChangeInfo) {
        self.merger.restore(info);
        self.dirty.mark(info.file);
    }

    /// Returns true if `file` awaits indexing.
    #[must_use]
    pub fn is_dirty(&self, file: FileId) -> bool {
        self.dirty.contains(file)
    }

    /// Dirty files in ascending order.
    #[must_use]
    pub fn dirty_files(&self) -> Vec<FileId> {
        self.dirty.snapshot()
    }

    /// Number of files with pending events.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.merger.len()
    }

    /// Opens a partition and re-queues the files it left dirty.
    pub fn open_partition(&self, name: &str) -> CoreResult<PartitionRecovery> {
        validate_name("partition", name)?;
        if name == ORPHAN_PARTITION {
            return Err(CoreError::invalid_format("partition name \"orphans\" is reserved"));
        }
        let mut partitions = self.partitions.lock();
        if let Some(owned) = partitions.get(name) {
            let mut dirty: Vec<FileId> = owned.iter().copied().filter(|f| self.dirty.contains(*f)).collect();
            dirty.sort_unstable();
            return Ok(PartitionRecovery {
                dirty,
                full_rescan_required: false,
            });
        }

        let recovery = match PartitionQueue::load(&self.dir.partition_queue_path(name))? {
            Some(saved) => {
                let (orphans, missed) = self.orphans.lock().since(saved.mark);
                let mut dirty = saved.dirty;
                dirty.extend(orphans);
                dirty.sort_unstable();
                dirty.dedup();
                PartitionRecovery {
                    dirty,
                    full_rescan_required: missed,
                }
            }
            None => PartitionRecovery {
                dirty: Vec::new(),
                full_rescan_required: true,
            },
        };

        for &file in &recovery.dirty {
            self.record_event(file, ChangeFlags::CONTENT_CHANGED);
        }
        partitions.insert(name.to_string(), recovery.dirty.iter().copied().collect());
        info!(
            partition = name,
            dirty = recovery.dirty.len(),
            full_rescan = recovery.full_rescan_required,
            "opened partition"
        );
        Ok(recovery)
    }

    /// Assigns `file` to an open partition.
    pub fn assign_to_partition(&self, file: FileId, name: &str) -> CoreResult<()> {
        let mut partitions = self.partitions.lock();
        let owned = partitions.get_mut(name).ok_or_else(|| CoreError::UnknownPartition {
            name: name.to_string(),
        })?;
        owned.insert(file);
        Ok(())
    }

    /// Closes a partition, handing its dirty files to its durable queue.
    ///
    /// Returns the number of dirty files saved.
    pub fn close_partition(&self, name: &str) -> CoreResult<usize> {
        let owned = self
            .partitions
            .lock()
            .remove(name)
            .ok_or_else(|| CoreError::UnknownPartition {
                name: name.to_string(),
            })?;
        self.save_partition(name, &owned)
    }

    fn save_partition(&self, name: &str, owned: &HashSet<FileId>) -> CoreResult<usize> {
        let mut dirty: Vec<FileId> = owned.iter().copied().filter(|f| self.dirty.contains(*f)).collect();
        dirty.sort_unstable();

        let queue = PartitionQueue {
            mark: self.orphans.lock().end(),
            dirty,
        };
        queue.save(&self.dir.partition_queue_path(name))?;

        for &file in &queue.dirty {
            self.merger.forget(file);
            self.dirty.unmark(file);
        }
        info!(partition = name, dirty = queue.dirty.len(), "closed partition");
        Ok(queue.dirty.len())
    }

    /// Closes every open partition and moves the remaining dirty files to
    /// the orphan queue.
    pub fn persist(&self) -> CoreResult<usize> {
        let open: Vec<(String, HashSet<FileId>)> = self.partitions.lock().drain().collect();
        for (name, owned) in &open {
            self.save_partition(name, owned)?;
        }

        let remaining = self.dirty.snapshot();
        let mut orphans = self.orphans.lock();
        orphans.push(remaining.iter().copied())?;
        orphans.save()?;
        if !remaining.is_empty() {
            info!(orphans = remaining.len(), "saved orphan dirty files");
        }
        Ok(remaining.len())
    }

    /// Re-queues every retained orphan for indexing and consumes it.
    ///
    /// Files still dirty at the next shutdown are orphaned again at the tail.
    pub fn recover_orphans(&self) -> Vec<FileId> {
        let orphans = self.orphans.lock().take_all();
        for &file in &orphans {
            self.record_event(file, ChangeFlags::CONTENT_CHANGED);
        }
        orphans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tracker(path: &std::path::Path) -> ChangeTracker {
        let dir = Arc::new(EngineDir::open(path, true).unwrap());
        ChangeTracker::open(dir, 100, 1).unwrap()
    }

    #[test]
    fn complete_keeps_files_with_new_events() {
        let temp = tempdir().unwrap();
        let tracker = tracker(temp.path());
        tracker.record_event(FileId(1), ChangeFlags::ADDED);
        tracker.record_event(FileId(2), ChangeFlags::ADDED);

        let drained = tracker.drain();
        assert_eq!(drained.len(), 2);
        tracker.record_event(FileId(2), ChangeFlags::CONTENT_CHANGED);

        tracker.complete(FileId(1));
        tracker.complete(FileId(2));
        assert_eq!(tracker.dirty_files(), vec![FileId(2)]);
    }

    #[test]
    fn requeued_removal_keeps_newer_addition() {
        let temp = tempdir().unwrap();
        let tracker = tracker(temp.path());
        tracker.record_event(FileId(5), ChangeFlags::REMOVED);
        let drained = tracker.drain();
        tracker.record_event(FileId(5), ChangeFlags::ADDED);

        tracker.requeue(drained[0]);
        let pending = tracker.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].flags, ChangeFlags::REMOVED | ChangeFlags::ADDED);
        assert!(tracker.is_dirty(FileId(5)));
    }

    #[test]
    fn complete_racing_a_record_keeps_the_file_dirty() {
        let temp = tempdir().unwrap();
        let tracker = tracker(temp.path());
        tracker.record_event(FileId(6), ChangeFlags::ADDED);
        tracker.drain();

        // A recorder has merged its event but not yet marked the file.
        tracker.merger.record(FileId(6), ChangeFlags::CONTENT_CHANGED);
        tracker.complete(FileId(6));
        tracker.dirty.mark(FileId(6));
        assert!(tracker.is_dirty(FileId(6)));

        // The completion ran before the recorder touched anything.
        tracker.drain();
        tracker.complete(FileId(6));
        assert!(!tracker.is_dirty(FileId(6)));
        tracker.record_event(FileId(6), ChangeFlags::CONTENT_CHANGED);
        assert_eq!(tracker.persist().unwrap(), 1);
    }

    #[test]
    fn unknown_partition_is_rejected() {
        let temp = tempdir().unwrap();
        let tracker = tracker(temp.path());
        assert!(matches!(
            tracker.assign_to_partition(FileId(1), "nope"),
            Err(CoreError::UnknownPartition { .. })
        ));
        assert!(tracker.open_partition("bad/name").is_err());
        assert!(tracker.open_partition("orphans").is_err());
    }

    #[test]
    fn partition_round_trip_across_restart() {
        let temp = tempdir().unwrap();
        {
            let tracker = tracker(temp.path());
            let first = tracker.open_partition("app").unwrap();
            assert!(first.full_rescan_required);

            tracker.assign_to_partition(FileId(10), "app").unwrap();
            tracker.assign_to_partition(FileId(11), "app").unwrap();
            tracker.record_event(FileId(10), ChangeFlags::CONTENT_CHANGED);
            tracker.record_event(FileId(99), ChangeFlags::ADDED);
            assert_eq!(tracker.persist().unwrap(), 1);
        }

        let tracker = tracker(temp.path());
        let recovery = tracker.open_partition("app").unwrap();
        assert!(!recovery.full_rescan_required);
        assert_eq!(recovery.dirty, vec![FileId(10), FileId(99)]);
        assert!(tracker.is_dirty(FileId(10)));
        assert_eq!(tracker.pending_events(), 2);
    }

    #[test]
    fn closed_partition_releases_its_dirty_files() {
        let temp = tempdir().unwrap();
        let tracker = tracker(temp.path());
        tracker.open_partition("lib").unwrap();
        tracker.assign_to_partition(FileId(3), "lib").unwrap();
        tracker.record_event(FileId(3), ChangeFlags::ADDED);

        assert_eq!(tracker.close_partition("lib").unwrap(), 1);
        assert!(!tracker.is_dirty(FileId(3)));
        assert_eq!(tracker.pending_events(), 0);

        let recovery = tracker.open_partition("lib").unwrap();
        assert_eq!(recovery.dirty, vec![FileId(3)]);
    }

    #[test]
    fn recover_orphans_requeues() {
        let temp = tempdir().unwrap();
        {
            let tracker = tracker(temp.path());
            tracker.record_event(FileId(7), ChangeFlags::ADDED);
            tracker.persist().unwrap();
        }
        let tracker = tracker(temp.path());
        assert_eq!(tracker.recover_orphans(), vec![FileId(7)]);
        assert!(tracker.is_dirty(FileId(7)));
    }

    #[test]
    fn reorphaned_file_reaches_partition_opened_later() {
        let temp = tempdir().unwrap();
        {
            let tracker = tracker(temp.path());
            tracker.record_event(FileId(5), ChangeFlags::ADDED);
            tracker.persist().unwrap();
        }
        {
            let tracker = tracker(temp.path());
            tracker.open_partition("app").unwrap();
            tracker.close_partition("app").unwrap();
            tracker.record_event(FileId(5), ChangeFlags::CONTENT_CHANGED);
            tracker.persist().unwrap();
        }

        let tracker = tracker(temp.path());
        let recovery = tracker.open_partition("app").unwrap();
        assert_eq!(recovery.dirty, vec![FileId(5)]);
        assert!(!recovery.full_rescan_required);
    }

    #[test]
    fn recovered_orphans_are_consumed() {
        let temp = tempdir().unwrap();
        {
            let tracker = tracker(temp.path());
            tracker.record_event(FileId(8), ChangeFlags::ADDED);
            tracker.persist().unwrap();
        }
        {
            let tracker = tracker(temp.path());
            assert_eq!(tracker.recover_orphans(), vec![FileId(8)]);
            let drained = tracker.drain();
            tracker.complete(drained[0].file);
            tracker.persist().unwrap();
        }

        let tracker = tracker(temp.path());
        assert!(tracker.recover_orphans().is_empty());
    }
}
