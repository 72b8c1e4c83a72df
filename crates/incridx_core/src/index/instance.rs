//! One registered index: its lock, rebuild state and tables.

use super::container::ValueContainer;
use super::definition::IndexDefinition;
use super::forward::ForwardIndex;
use super::inverted::{IdFilter, InvertedStorage};
use super::stamps::StampTable;
use crate::buffering::BufferMode;
use crate::cancel::TaskContext;
use crate::config::Config;
use crate::content::FileContent;
use crate::dir::{validate_name, EngineDir};
use crate::error::{CoreError, CoreResult};
use crate::rebuild::{IndexEventListener, ReadPolicy, RebuildOutcome, RebuildState, RebuildStatus};
use crate::stats::EngineStats;
use crate::table::LogMap;
use crate::types::{FileId, IndexId, IndexingStamp, UNINDEXED_STAMP};
use crate::version::{VersionDiff, VersionStore};
use parking_lot::{RwLock, RwLockReadGuard};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Engine-wide services shared by every index.
pub(crate) struct IndexEnv {
    pub dir: Arc<EngineDir>,
    pub versions: VersionStore,
    pub config: Config,
    pub stats: Arc<EngineStats>,
    pub listener: Option<Arc<dyn IndexEventListener>>,
}

impl fmt::Debug for IndexEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexEnv")
            .field("root", &self.dir.path())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Outcome of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAttempt {
    /// State was written and synced.
    Flushed,
    /// Nothing was waiting to be written.
    Clean,
    /// The index lock was busy; nothing was done.
    Contended,
    /// The index is being rebuilt; nothing was done.
    NotReady,
}

/// Type-erased view of a registered index.
pub(crate) trait IndexHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> &IndexId;
    fn rebuild_state(&self) -> &RebuildState;
    fn needs_update(&self, file: FileId, content: &FileContent) -> CoreResult<bool>;
    fn update(
        &self,
        ctx: &TaskContext,
        file: FileId,
        content: Option<&FileContent>,
        mode: BufferMode,
    ) -> CoreResult<()>;
    fn indexing_stamp(&self, file: FileId) -> CoreResult<IndexingStamp>;
    fn invalidate_file(&self, file: FileId) -> CoreResult<bool>;
    fn invalidate_all(&self) -> CoreResult<usize>;
    fn has_unflushed(&self) -> bool;
    fn try_flush(&self) -> CoreResult<FlushAttempt>;
    fn flush(&self) -> CoreResult<FlushAttempt>;
    fn request_rebuild(&self, cause: &dyn fmt::Display) -> CoreResult<RebuildOutcome>;
    fn rebuild(&self) -> CoreResult<RebuildOutcome>;
    fn discard_buffered(&self);
    fn as_any(&self) -> &dyn Any;
}

/// A registered index with its definition and storage.
pub(crate) struct IndexInstance<D: IndexDefinition> {
    pub(super) id: IndexId,
    pub(super) definition: D,
    pub(super) env: Arc<IndexEnv>,
    pub(super) lock: RwLock<()>,
    pub(super) rebuild: RebuildState,
    pub(super) entries: InvertedStorage<D::Key, D::Value>,
    pub(super) forward: ForwardIndex<D::Key>,
    pub(super) stamps: StampTable,
    pub(super) creation_stamp: AtomicI64,
    unflushed: AtomicBool,
}

impl<D: IndexDefinition> fmt::Debug for IndexInstance<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexInstance")
            .field("id", &self.id)
            .field("status", &self.rebuild.status())
            .field("creation_stamp", &self.creation_stamp.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

type Tables<D> = (
    InvertedStorage<<D as IndexDefinition>::Key, <D as IndexDefinition>::Value>,
    ForwardIndex<<D as IndexDefinition>::Key>,
    StampTable,
);

impl<D: IndexDefinition> IndexInstance<D> {
    /// Version-checks and opens an index, wiping it if its data cannot be used.
    pub(crate) fn open(definition: D, env: Arc<IndexEnv>) -> CoreResult<(Self, VersionDiff)> {
        let name = definition.name().to_string();
        validate_name("index", &name)?;
        let schema = definition.version();

        let mut diff = env.versions.version_diff(&name, schema)?;
        let version = if diff.requires_rebuild() {
            if diff != VersionDiff::InitialBuild {
                let cause = CoreError::VersionMismatch {
                    index: name.clone(),
                    diff,
                };
                warn!(index = %name, cause = %cause, "index data is stale, recreating");
            }
            env.dir.wipe_index(&name)?;
            env.versions.rewrite_version(&name, schema)?
        } else {
            env.versions
                .read_version(&name)?
                .ok_or_else(|| CoreError::corruption(&name, "version record vanished"))?
        };
        let mut creation_stamp = version.creation_stamp;

        let tables = match Self::open_tables(&env, &name) {
            Ok(tables) => tables,
            Err(e) if e.requires_rebuild() => {
                warn!(index = %name, error = %e, "index tables unreadable, recreating");
                diff = VersionDiff::CorruptedRebuild;
                env.dir.wipe_index(&name)?;
                creation_stamp = env.versions.rewrite_version(&name, schema)?.creation_stamp;
                Self::open_tables(&env, &name)?
            }
            Err(e) => return Err(e),
        };

        info!(index = %name, ?diff, creation_stamp, "index registered");
        Ok((Self::assemble(definition, env, tables, creation_stamp), diff))
    }

    /// Opens a fresh index whose tables live on the given in-memory backends,
    /// in `entries`, `forward`, `stamps` order.
    #[cfg(test)]
    pub(crate) fn open_on(
        definition: D,
        env: Arc<IndexEnv>,
        backends: [incridx_storage::InMemoryBackend; 3],
    ) -> CoreResult<Self> {
        use crate::table::TableLocation;

        let name = definition.name().to_string();
        env.dir.ensure_index_dir(&name)?;
        let creation_stamp = env.versions.rewrite_version(&name, definition.version())?.creation_stamp;
        let [entries, forward, stamps] =
            backends.map(|backend| LogMap::open(name.as_str(), Box::new(backend), TableLocation::Memory));
        let tables = (
            InvertedStorage::new(entries?, env.config.cache_capacity),
            ForwardIndex::new(forward?),
            StampTable::new(stamps?),
        );
        Ok(Self::assemble(definition, env, tables, creation_stamp))
    }

    fn assemble(definition: D, env: Arc<IndexEnv>, tables: Tables<D>, creation_stamp: i64) -> Self {
        let (entries, forward, stamps) = tables;
        Self {
            id: IndexId::new(definition.name()),
            definition,
            env,
            lock: RwLock::new(()),
            rebuild: RebuildState::new(),
            entries,
            forward,
            stamps,
            creation_stamp: AtomicI64::new(creation_stamp),
            unflushed: AtomicBool::new(false),
        }
    }

    fn open_tables(env: &IndexEnv, name: &str) -> CoreResult<Tables<D>> {
        env.dir.ensure_index_dir(name)?;
        let entries = InvertedStorage::new(
            LogMap::open_file(name, &env.dir.entries_path(name))?,
            env.config.cache_capacity,
        );
        let forward = ForwardIndex::new(LogMap::open_file(name, &env.dir.forward_path(name))?);
        let stamps = StampTable::new(LogMap::open_file(name, &env.dir.stamps_path(name))?);
        Ok((entries, forward, stamps))
    }

    /// Returns the definition.
    pub(crate) fn definition(&self) -> &D {
        &self.definition
    }

    pub(crate) fn current_stamp(&self) -> i64 {
        self.creation_stamp.load(Ordering::Acquire)
    }

    /// Records that this index has state not yet flushed.
    pub(super) fn note_unflushed(&self) -> CoreResult<()> {
        if !self.unflushed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.env.dir.mark_dirty(self.id.as_str()) {
                self.unflushed.store(false, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Converts an unrecoverable error into a rebuild request.
    pub(super) fn mark_corrupted(&self, cause: &dyn fmt::Display) {
        if self.rebuild.request(self.id.as_str(), cause) {
            if let Some(listener) = &self.env.listener {
                listener.on_rebuild_required(&self.id);
            }
        }
    }

    fn not_ready(&self) -> CoreError {
        CoreError::not_ready(self.id.as_str(), self.rebuild.status())
    }

    /// Takes the read lock once the index is `Ok`, honoring `policy`.
    fn read_gate(&self, policy: ReadPolicy) -> CoreResult<RwLockReadGuard<'_, ()>> {
        loop {
            match (self.rebuild.status(), policy) {
                (RebuildStatus::Ok, _) => {
                    let guard = self.lock.read();
                    if self.rebuild.is_ok() {
                        return Ok(guard);
                    }
                }
                (_, ReadPolicy::FailFast) => return Err(self.not_ready()),
                (RebuildStatus::RequiresRebuild, ReadPolicy::WaitForRebuild) => {
                    if let Err(e) = self.rebuild() {
                        warn!(index = %self.id, error = %e, "rebuild on behalf of a query failed");
                        return Err(self.not_ready());
                    }
                }
                (RebuildStatus::RebuildInProgress, ReadPolicy::WaitForRebuild) => {
                    self.rebuild.wait_while_in_progress();
                }
            }
        }
    }

    /// Runs a read-only operation under the read lock.
    ///
    /// Storage errors never reach the caller: they request a rebuild and
    /// surface as `IndexNotReady`.
    pub(super) fn query<R>(&self, policy: ReadPolicy, op: impl FnOnce(&Self) -> CoreResult<R>) -> CoreResult<R> {
        let guard = self.read_gate(policy)?;
        let result = op(self);
        drop(guard);

        match result {
            Ok(value) => {
                self.env.stats.record_query();
                Ok(value)
            }
            Err(e) if e.requires_rebuild() => {
                self.env.stats.record_error();
                self.mark_corrupted(&e);
                Err(self.not_ready())
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the container stored under `key`.
    pub(crate) fn get_container(&self, key: &D::Key, policy: ReadPolicy) -> CoreResult<ValueContainer<D::Value>> {
        self.query(policy, |index| index.entries.read(key))
    }

    /// Visits keys in ascending order; see [`InvertedStorage::process_keys`].
    pub(crate) fn process_keys(
        &self,
        predicate: &dyn Fn(&D::Key) -> bool,
        id_filter: Option<IdFilter<'_>>,
        ctx: &TaskContext,
        policy: ReadPolicy,
        processor: &mut dyn FnMut(&D::Key, &ValueContainer<D::Value>) -> bool,
    ) -> CoreResult<usize> {
        let _marker = ctx.enter(&self.id)?;
        let batch = self.env.config.scan_batch_size;
        let result = self.query(policy, |index| {
            index.entries.process_keys(predicate, id_filter, ctx, batch, processor)
        });
        match &result {
            Ok(visited) => self.env.stats.record_keys_scanned(*visited as u64),
            Err(CoreError::Cancelled(_)) => {
                debug!(index = %self.id, "key scan cancelled");
                self.env.stats.record_cancelled_scan();
            }
            Err(_) => {}
        }
        result
    }

    /// Keys `file` contributes according to the forward index.
    pub(crate) fn forward_keys(&self, file: FileId, policy: ReadPolicy) -> CoreResult<BTreeSet<D::Key>> {
        self.query(policy, |index| index.forward.read_input_keys(file))
    }

    /// Files with a non-empty forward record.
    pub(crate) fn indexed_files(&self, policy: ReadPolicy) -> CoreResult<Vec<FileId>> {
        self.query(policy, |index| index.forward.files())
    }

    fn flush_locked(&self) -> CoreResult<FlushAttempt> {
        if !self.has_unflushed() && !self.entries.has_dirty_entries() {
            return Ok(FlushAttempt::Clean);
        }

        let written = self.entries.flush()?;
        self.forward.flush()?;
        self.stamps.flush()?;

        let threshold = self.env.config.compaction_garbage_ratio;
        for table in [self.entries.table(), self.forward.table(), self.stamps.table()] {
            if table.garbage_ratio() > threshold {
                table.compact()?;
                self.env.stats.record_compaction();
            }
        }

        if self.unflushed.swap(false, Ordering::AcqRel) {
            self.env.dir.clear_dirty(self.id.as_str())?;
        }
        self.env.stats.record_flush();
        debug!(index = %self.id, entries = written, "flushed index");
        Ok(FlushAttempt::Flushed)
    }

    fn flush_with(&self, guard: Option<RwLockReadGuard<'_, ()>>) -> CoreResult<FlushAttempt> {
        let Some(_guard) = guard else {
            return Ok(FlushAttempt::Contended);
        };
        if !self.rebuild.is_ok() {
            return Ok(FlushAttempt::NotReady);
        }
        self.flush_locked().inspect_err(|e| {
            self.env.stats.record_error();
            self.mark_corrupted(e);
        })
    }
}

impl<D: IndexDefinition> IndexHandle for IndexInstance<D> {
    fn id(&self) -> &IndexId {
        &self.id
    }

    fn rebuild_state(&self) -> &RebuildState {
        &self.rebuild
    }

    fn needs_update(&self, file: FileId, content: &FileContent) -> CoreResult<bool> {
        if content.kind() == crate::content::ContentKind::Speculative {
            return Ok(true);
        }
        if !self.definition.accepts(content) {
            return Ok(self.stamps.get(file)?.is_some() || !self.forward.read_input_keys(file)?.is_empty());
        }
        Ok(match self.stamps.get(file)? {
            Some(stamp) => stamp.stamp != self.current_stamp() || stamp.fingerprint != content.fingerprint(),
            None => true,
        })
    }

    fn update(
        &self,
        ctx: &TaskContext,
        file: FileId,
        content: Option<&FileContent>,
        mode: BufferMode,
    ) -> CoreResult<()> {
        self.update_file(ctx, file, content, mode)
    }

    fn indexing_stamp(&self, file: FileId) -> CoreResult<IndexingStamp> {
        let raw = self.stamps.get(file)?.map_or(UNINDEXED_STAMP, |s| s.stamp);
        Ok(IndexingStamp::classify(raw, self.current_stamp()))
    }

    fn invalidate_file(&self, file: FileId) -> CoreResult<bool> {
        let _guard = self.lock.write();
        if !self.rebuild.is_ok() {
            return Ok(false);
        }
        self.note_unflushed()?;
        self.stamps.invalidate(file)
    }

    fn invalidate_all(&self) -> CoreResult<usize> {
        let _guard = self.lock.write();
        if !self.rebuild.is_ok() {
            return Ok(0);
        }
        self.note_unflushed()?;
        let count = self.stamps.invalidate_all()?;
        info!(index = %self.id, files = count, "invalidated all stamps");
        Ok(count)
    }

    fn has_unflushed(&self) -> bool {
        self.unflushed.load(Ordering::Acquire)
    }

    fn try_flush(&self) -> CoreResult<FlushAttempt> {
        self.flush_with(self.lock.try_read())
    }

    fn flush(&self) -> CoreResult<FlushAttempt> {
        self.flush_with(Some(self.lock.read()))
    }

    fn request_rebuild(&self, cause: &dyn fmt::Display) -> CoreResult<RebuildOutcome> {
        self.mark_corrupted(cause);
        self.rebuild()
    }

    fn rebuild(&self) -> CoreResult<RebuildOutcome> {
        let Some(rebuild) = self.rebuild.try_begin() else {
            return Ok(RebuildOutcome::AlreadyInProgress);
        };
        if let Some(listener) = &self.env.listener {
            listener.on_rebuild_started(&self.id);
        }

        let write = self.lock.write();
        self.entries.clear()?;
        self.forward.clear()?;
        self.stamps.clear()?;
        let version = self
            .env
            .versions
            .rewrite_version(self.id.as_str(), self.definition.version())?;
        self.creation_stamp.store(version.creation_stamp, Ordering::Release);
        self.unflushed.store(false, Ordering::Release);
        self.env.dir.clear_dirty(self.id.as_str())?;
        drop(write);

        rebuild.finish();
        self.env.stats.record_rebuild();
        info!(index = %self.id, creation_stamp = version.creation_stamp, "index rebuilt");
        if let Some(listener) = &self.env.listener {
            listener.on_rebuild_finished(&self.id);
        }
        Ok(RebuildOutcome::Performed)
    }

    fn discard_buffered(&self) {
        self.entries.discard_buffered();
        self.forward.discard_buffered();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
