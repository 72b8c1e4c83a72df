//! The engine facade.
//!
//! An [`Engine`] owns one root directory, the registered indices, the change
//! tracker, the buffering gate and the background flusher. Every public
//! operation of the crate is reachable from here.

use crate::buffering::{BufferMode, BufferingGate, BufferingGuard};
use crate::cancel::TaskContext;
use crate::changes::{ChangeFlags, ChangeInfo, ChangeTracker, PartitionRecovery};
use crate::config::Config;
use crate::content::{ContentSource, FileContent};
use crate::dir::{validate_name, EngineDir};
use crate::error::{CoreError, CoreResult};
use crate::flusher::{BackgroundFlusher, FlushScheduler, RoundReport};
use crate::index::{FlushAttempt, IdFilter, IndexDefinition, IndexEnv, IndexHandle, IndexInstance, ValueContainer};
use crate::rebuild::{IndexEventListener, ReadPolicy, RebuildOutcome, RebuildStatus};
use crate::registry::{IndexRef, IndexRegistry};
use crate::stats::EngineStats;
use crate::types::{FileId, IndexId, IndexingStamp};
use crate::version::{Clock, IndexVersion, SystemClock, VersionDiff, VersionStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An index definition waiting for the engine to open.
trait PendingIndex: Send {
    fn open(self: Box<Self>, env: Arc<IndexEnv>) -> CoreResult<(Arc<dyn IndexHandle>, VersionDiff)>;
}

struct Pending<D>(D);

impl<D: IndexDefinition> PendingIndex for Pending<D> {
    fn open(self: Box<Self>, env: Arc<IndexEnv>) -> CoreResult<(Arc<dyn IndexHandle>, VersionDiff)> {
        let (instance, diff) = IndexInstance::open(self.0, env)?;
        Ok((Arc::new(instance), diff))
    }
}

/// Collects index definitions and collaborators before opening an engine.
///
/// # Example
///
/// ```rust,ignore
/// let mut builder = EngineBuilder::new();
/// let words = builder.register(WordCount)?;
/// let engine = Engine::open("index-root", Config::default(), builder)?;
/// let files = engine.get_files(&words, &"hello".to_string(), ReadPolicy::FailFast)?;
/// ```
pub struct EngineBuilder {
    pending: Vec<Box<dyn PendingIndex>>,
    names: HashSet<String>,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn IndexEventListener>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("indices", &self.names)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Creates a builder with the system clock and no listener.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            names: HashSet::new(),
            clock: Arc::new(SystemClock),
            listener: None,
        }
    }

    /// Registers an index definition.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateIndex` if the name is taken and `InvalidFormat` if
    /// it cannot be used as a directory name.
    pub fn register<D: IndexDefinition>(&mut self, definition: D) -> CoreResult<IndexRef<D>> {
        let name = definition.name().to_string();
        validate_name("index", &name)?;
        if !self.names.insert(name.clone()) {
            return Err(CoreError::DuplicateIndex { name });
        }
        self.pending.push(Box::new(Pending(definition)));
        Ok(IndexRef::new(IndexId::new(&name)))
    }

    /// Replaces the clock used for creation stamps and queue generations.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Installs a listener for rebuild transitions.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn IndexEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

/// Counts from one [`Engine::process_changes`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    /// Merged changes drained from the tracker.
    pub changes: usize,
    /// Index transactions that re-indexed a file.
    pub indexed: usize,
    /// Files removed from every index.
    pub removed: usize,
    /// Files whose stamps were invalidated.
    pub invalidated: usize,
    /// Changes put back because they could not be applied.
    pub failed: usize,
}

/// An incremental indexing engine rooted at one directory.
pub struct Engine {
    env: Arc<IndexEnv>,
    registry: Arc<IndexRegistry>,
    tracker: ChangeTracker,
    gate: BufferingGate,
    scheduler: Arc<Mutex<FlushScheduler>>,
    flusher: Mutex<Option<BackgroundFlusher>>,
    report: Vec<(IndexId, VersionDiff)>,
    is_open: RwLock<bool>,
}

impl Engine {
    /// Opens the engine at `path` and every index registered on `builder`.
    ///
    /// Each index is version-checked; an index that is new, changed or
    /// found corrupted starts empty. See [`Engine::registration_report`].
    ///
    /// # Errors
    ///
    /// Returns `EngineLocked` if another process holds the root, and
    /// storage errors that prevent the root or an index from opening.
    pub fn open(path: impl AsRef<Path>, config: Config, builder: EngineBuilder) -> CoreResult<Self> {
        let path = path.as_ref();
        let EngineBuilder {
            pending,
            clock,
            listener,
            ..
        } = builder;

        let dir = Arc::new(EngineDir::open(path, config.create_if_missing)?);
        let versions = VersionStore::open(
            Arc::clone(&dir),
            Arc::clone(&clock),
            config.common_version(),
            config.stamp_resolution,
        )?;
        let tracker = ChangeTracker::open(Arc::clone(&dir), config.orphan_queue_max_size, clock.now_millis())?;

        let env = Arc::new(IndexEnv {
            dir,
            versions,
            config,
            stats: Arc::new(EngineStats::new()),
            listener,
        });

        let mut registry = IndexRegistry::new();
        let mut report = Vec::with_capacity(pending.len());
        for index in pending {
            let (handle, diff) = index.open(Arc::clone(&env))?;
            report.push((handle.id().clone(), diff));
            registry.insert(handle)?;
        }
        let registry = Arc::new(registry);

        let gate = {
            let registry = Arc::clone(&registry);
            BufferingGate::with_drain_hook(move || {
                for handle in registry.handles() {
                    handle.discard_buffered();
                }
            })
        };

        let scheduler = Arc::new(Mutex::new(FlushScheduler::new(&env.config)));
        let flusher = if env.config.background_flush {
            Some(BackgroundFlusher::start(
                Arc::clone(&registry),
                Arc::clone(&scheduler),
                Arc::clone(&env.stats),
                env.config.flush_interval,
            )?)
        } else {
            None
        };

        info!(
            path = %path.display(),
            indices = registry.len(),
            epoch = env.versions.storage_epoch(),
            "engine opened"
        );

        Ok(Self {
            env,
            registry,
            tracker,
            gate,
            scheduler,
            flusher: Mutex::new(flusher),
            report,
            is_open: RwLock::new(true),
        })
    }

    /// Flushes every index, persists dirty-file queues and stops the
    /// flusher. Idempotent.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        *is_open = false;

        if let Some(mut flusher) = self.flusher.lock().take() {
            flusher.stop();
        }
        let flushed = self.flush_indices();
        let orphans = self.tracker.persist();
        flushed?;
        let orphans = orphans?;

        info!(path = %self.env.dir.path().display(), orphans, "engine closed");
        Ok(())
    }

    /// Returns true until [`Engine::close`] runs.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::EngineClosed)
        }
    }

    /// Returns the configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.env.config
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// Records a raw change event for `file`.
    pub fn record_event(&self, file: FileId, flags: ChangeFlags) -> CoreResult<()> {
        self.ensure_open()?;
        self.tracker.record_event(file, flags);
        Ok(())
    }

    /// Applies every pending change, fetching content from `source`.
    ///
    /// Indices that require a rebuild are rebuilt first. A change that fails
    /// is put back and its file stays dirty.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the context's token fires; unprocessed changes
    /// are put back first.
    pub fn process_changes(&self, source: &dyn ContentSource, ctx: &TaskContext) -> CoreResult<ProcessReport> {
        self.ensure_open()?;
        self.rebuild_pending();

        let changes = self.tracker.drain();
        let mut report = ProcessReport {
            changes: changes.len(),
            ..ProcessReport::default()
        };

        let mut changes = changes.into_iter();
        while let Some(info) = changes.next() {
            if let Err(cancelled) = ctx.check_cancelled() {
                self.tracker.requeue(info);
                changes.for_each(|rest| self.tracker.requeue(rest));
                return Err(cancelled.into());
            }

            match self.apply_change(&info, source, ctx, &mut report) {
                Ok(()) => self.tracker.complete(info.file),
                Err(e) => {
                    warn!(file = %info.file, flags = ?info.flags, error = %e, "change not applied, keeping file dirty");
                    report.failed += 1;
                    self.tracker.requeue(info);
                    if matches!(e, CoreError::Cancelled(_)) {
                        changes.for_each(|rest| self.tracker.requeue(rest));
                        return Err(e);
                    }
                }
            }
        }

        debug!(?report, "processed changes");
        Ok(report)
    }

    fn apply_change(
        &self,
        info: &ChangeInfo,
        source: &dyn ContentSource,
        ctx: &TaskContext,
        report: &mut ProcessReport,
    ) -> CoreResult<()> {
        let file = info.file;
        let flags = info.flags;

        if flags.contains(ChangeFlags::REMOVED) {
            self.remove_file(file, ctx)?;
            report.removed += 1;
            if !flags.contains(ChangeFlags::ADDED) {
                return Ok(());
            }
        }

        if flags.intersects(ChangeFlags::ADDED | ChangeFlags::CONTENT_CHANGED) {
            let content = source.content(file).map_err(|e| CoreError::Content {
                file,
                message: e.to_string(),
            })?;
            match content {
                Some(content) => report.indexed += self.index_file(file, &content, ctx)?,
                None if flags.contains(ChangeFlags::REMOVED) => {}
                None => {
                    self.remove_file(file, ctx)?;
                    report.removed += 1;
                }
            }
            return Ok(());
        }

        if flags.intersects(ChangeFlags::BEFORE_CONTENT_CHANGED | ChangeFlags::TRANSIENT_STATE_CHANGED) {
            self.invalidate_file(file)?;
            report.invalidated += 1;
        }
        Ok(())
    }

    fn rebuild_pending(&self) {
        for handle in self.registry.handles() {
            if handle.rebuild_state().status() == RebuildStatus::RequiresRebuild {
                if let Err(e) = handle.rebuild() {
                    warn!(index = %handle.id(), error = %e, "rebuild failed");
                }
            }
        }
    }

    /// Indexes `content` as the current state of `file` in every index
    /// whose stored state is stale.
    ///
    /// Speculative content is written to the buffered overlays and never
    /// reaches disk. The overlays live only as long as some buffered scope
    /// is held, so a host indexing speculative content must hold
    /// [`Engine::enter_buffering`] with [`BufferMode::Buffered`] around the
    /// call and the queries that should see it. Without such a scope the
    /// overlay is dropped before this returns. Returns the number of
    /// indices updated.
    ///
    /// # Errors
    ///
    /// Every index is attempted; the first failure is returned afterwards.
    pub fn index_file(&self, file: FileId, content: &FileContent, ctx: &TaskContext) -> CoreResult<usize> {
        self.ensure_open()?;
        let mode = BufferMode::from(content.kind());
        let _scope = self.gate.enter(mode);
        if mode == BufferMode::Buffered && self.gate.occupancy() == 1 {
            warn!(%file, "speculative content indexed outside a buffered scope, it is discarded on return");
        }

        let mut updated = 0;
        let mut first_error = None;
        for handle in self.registry.handles() {
            if !handle.needs_update(file, content).unwrap_or(true) {
                continue;
            }
            match handle.update(ctx, file, Some(content), mode) {
                Ok(()) => updated += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(updated), Err)
    }

    /// Removes `file` from every index.
    pub fn remove_file(&self, file: FileId, ctx: &TaskContext) -> CoreResult<()> {
        self.ensure_open()?;
        let _scope = self.gate.enter(BufferMode::Persistent);

        let mut first_error = None;
        for handle in self.registry.handles() {
            if let Err(e) = handle.update(ctx, file, None, BufferMode::Persistent) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Holds the buffering gate in `mode` until the guard drops.
    ///
    /// Lets a host group several speculative updates into one scope. The
    /// overlays are discarded when the last buffered scope ends. Indexing
    /// content of the other mode on the same thread while holding the guard
    /// deadlocks.
    pub fn enter_buffering(&self, mode: BufferMode) -> CoreResult<BufferingGuard<'_>> {
        self.ensure_open()?;
        Ok(self.gate.enter(mode))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Reads the value container stored under `key`.
    pub fn get_container<D: IndexDefinition>(
        &self,
        index: &IndexRef<D>,
        key: &D::Key,
        policy: ReadPolicy,
    ) -> CoreResult<ValueContainer<D::Value>> {
        self.ensure_open()?;
        self.registry.typed(index)?.get_container(key, policy)
    }

    /// Distinct values stored under `key`.
    pub fn get_values<D: IndexDefinition>(
        &self,
        index: &IndexRef<D>,
        key: &D::Key,
        policy: ReadPolicy,
    ) -> CoreResult<Vec<D::Value>> {
        Ok(self.get_container(index, key, policy)?.values().cloned().collect())
    }

    /// Files associated with `key`, ascending.
    pub fn get_files<D: IndexDefinition>(
        &self,
        index: &IndexRef<D>,
        key: &D::Key,
        policy: ReadPolicy,
    ) -> CoreResult<Vec<FileId>> {
        Ok(self.get_container(index, key, policy)?.files())
    }

    /// Visits keys matching `predicate` in ascending order.
    ///
    /// With an `id_filter`, keys whose container holds no accepted file are
    /// skipped. `processor` returns false to stop early. Cancellation is
    /// polled every `scan_batch_size` keys. Returns the number of keys
    /// handed to `processor`.
    pub fn process_keys<D: IndexDefinition>(
        &self,
        index: &IndexRef<D>,
        predicate: impl Fn(&D::Key) -> bool,
        id_filter: Option<IdFilter<'_>>,
        ctx: &TaskContext,
        policy: ReadPolicy,
        mut processor: impl FnMut(&D::Key, &ValueContainer<D::Value>) -> bool,
    ) -> CoreResult<usize> {
        self.ensure_open()?;
        self.registry
            .typed(index)?
            .process_keys(&predicate, id_filter, ctx, policy, &mut processor)
    }

    /// Keys `file` currently contributes to an index.
    pub fn forward_keys<D: IndexDefinition>(
        &self,
        index: &IndexRef<D>,
        file: FileId,
        policy: ReadPolicy,
    ) -> CoreResult<BTreeSet<D::Key>> {
        self.ensure_open()?;
        self.registry.typed(index)?.forward_keys(file, policy)
    }

    /// Files with at least one key in an index.
    pub fn indexed_files<D: IndexDefinition>(&self, index: &IndexRef<D>, policy: ReadPolicy) -> CoreResult<Vec<FileId>> {
        self.ensure_open()?;
        self.registry.typed(index)?.indexed_files(policy)
    }

    /// Indexing state of `file` in an index.
    pub fn indexing_stamp<D: IndexDefinition>(&self, index: &IndexRef<D>, file: FileId) -> CoreResult<IndexingStamp> {
        self.ensure_open()?;
        let instance = self.registry.typed(index)?;
        let status = instance.rebuild_state().status();
        if status != RebuildStatus::Ok {
            return Err(CoreError::not_ready(index.name(), status));
        }
        instance.indexing_stamp(file)
    }

    /// Marks the stamp of `file` outdated in every index.
    ///
    /// Returns the number of indices that held a stamp for it.
    pub fn invalidate_file(&self, file: FileId) -> CoreResult<usize> {
        self.ensure_open()?;
        let mut invalidated = 0;
        for handle in self.registry.handles() {
            if handle.invalidate_file(file)? {
                invalidated += 1;
            }
        }
        Ok(invalidated)
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Clears an index and starts it over.
    ///
    /// Returns `AlreadyInProgress` if another thread is rebuilding it.
    pub fn request_rebuild(&self, name: &str) -> CoreResult<RebuildOutcome> {
        self.ensure_open()?;
        self.registry.by_name(name)?.request_rebuild(&"explicit rebuild request")
    }

    /// Flushes every index, waiting for index locks.
    ///
    /// Returns the number of indices that had something to write.
    pub fn flush_all(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        self.flush_indices()
    }

    fn flush_indices(&self) -> CoreResult<usize> {
        let mut flushed = 0;
        let mut first_error = None;
        for handle in self.registry.handles() {
            match handle.flush() {
                Ok(FlushAttempt::Flushed) => flushed += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(index = %handle.id(), error = %e, "flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(flushed), Err)
    }

    /// Runs one non-blocking flush round, as the background flusher does.
    pub fn flush_round(&self) -> CoreResult<RoundReport> {
        self.ensure_open()?;
        Ok(self.scheduler.lock().run_round(&self.registry, &self.env.stats))
    }

    /// Marks every stored stamp of every index outdated.
    ///
    /// Indexed data stays queryable; the next `index_file` of each file
    /// re-indexes it. Returns the number of stamps invalidated.
    pub fn invalidate_all(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        let mut total = 0;
        for handle in self.registry.handles() {
            total += handle.invalidate_all()?;
        }
        info!(stamps = total, "invalidated all indices");
        Ok(total)
    }

    /// Rebuild status of an index.
    pub fn status(&self, name: &str) -> CoreResult<RebuildStatus> {
        Ok(self.registry.by_name(name)?.rebuild_state().status())
    }

    /// Persisted version record of an index.
    pub fn index_version(&self, name: &str) -> CoreResult<IndexVersion> {
        self.ensure_open()?;
        let id = self.registry.by_name(name)?.id();
        self.env
            .versions
            .read_version(id.as_str())?
            .ok_or_else(|| CoreError::corruption(name, "version record missing"))
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.env.stats
    }

    /// Version check outcome of every index at open, in registration order.
    #[must_use]
    pub fn registration_report(&self) -> &[(IndexId, VersionDiff)] {
        &self.report
    }

    /// Registered index names, in registration order.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.registry.names()
    }

    // ========================================================================
    // Dirty files
    // ========================================================================

    /// Opens a partition and queues the files it left dirty.
    pub fn open_partition(&self, name: &str) -> CoreResult<PartitionRecovery> {
        self.ensure_open()?;
        self.tracker.open_partition(name)
    }

    /// Assigns `file` to an open partition.
    pub fn assign_to_partition(&self, file: FileId, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        self.tracker.assign_to_partition(file, name)
    }

    /// Saves a partition's dirty files and stops tracking them.
    pub fn close_partition(&self, name: &str) -> CoreResult<usize> {
        self.ensure_open()?;
        self.tracker.close_partition(name)
    }

    /// Queues every file left in the orphan queue by earlier sessions.
    pub fn recover_orphans(&self) -> CoreResult<Vec<FileId>> {
        self.ensure_open()?;
        let orphans = self.tracker.recover_orphans();
        if !orphans.is_empty() {
            info!(files = orphans.len(), "recovered orphan dirty files");
        }
        Ok(orphans)
    }

    /// Files awaiting indexing, ascending.
    #[must_use]
    pub fn dirty_files(&self) -> Vec<FileId> {
        self.tracker.dirty_files()
    }

    /// Returns true if `file` awaits indexing.
    #[must_use]
    pub fn is_dirty(&self, file: FileId) -> bool {
        self.tracker.is_dirty(file)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.env.dir.path())
            .field("indices", &self.registry.names())
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "engine close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentError;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct Words;

    impl IndexDefinition for Words {
        type Key = String;
        type Value = ();

        fn name(&self) -> &str {
            "words"
        }

        fn version(&self) -> u32 {
            1
        }

        fn map(&self, content: &FileContent) -> HashMap<String, ()> {
            content
                .text()
                .unwrap_or_default()
                .split_whitespace()
                .map(|w| (w.to_string(), ()))
                .collect()
        }
    }

    struct Lengths;

    impl IndexDefinition for Lengths {
        type Key = u64;
        type Value = u64;

        fn name(&self) -> &str {
            "lengths"
        }

        fn version(&self) -> u32 {
            1
        }

        fn map(&self, content: &FileContent) -> HashMap<u64, u64> {
            HashMap::from([(content.bytes().len() as u64, content.fingerprint())])
        }
    }

    #[derive(Default)]
    struct Files(Mutex<HashMap<FileId, FileContent>>);

    impl Files {
        fn set(&self, file: FileId, text: &str) {
            self.0.lock().insert(file, FileContent::persisted(text.as_bytes()));
        }

        fn delete(&self, file: FileId) {
            self.0.lock().remove(&file);
        }
    }

    impl ContentSource for Files {
        fn content(&self, file: FileId) -> Result<Option<FileContent>, ContentError> {
            Ok(self.0.lock().get(&file).cloned())
        }
    }

    fn config() -> Config {
        Config::new().background_flush(false)
    }

    fn open(path: &Path) -> (Engine, IndexRef<Words>, IndexRef<Lengths>) {
        let mut builder = EngineBuilder::new();
        let words = builder.register(Words).unwrap();
        let lengths = builder.register(Lengths).unwrap();
        (Engine::open(path, config(), builder).unwrap(), words, lengths)
    }

    fn key(word: &str) -> String {
        word.to_string()
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut builder = EngineBuilder::new();
        builder.register(Words).unwrap();
        assert!(matches!(builder.register(Words), Err(CoreError::DuplicateIndex { .. })));
    }

    #[test]
    fn process_changes_indexes_and_removes() {
        let temp = tempdir().unwrap();
        let (engine, words, lengths) = open(temp.path());
        let source = Files::default();
        let ctx = TaskContext::new();
        let file = FileId::new(1);

        source.set(file, "hello world");
        engine.record_event(file, ChangeFlags::ADDED).unwrap();
        let report = engine.process_changes(&source, &ctx).unwrap();
        assert_eq!(report.changes, 1);
        assert_eq!(report.indexed, 2);
        assert!(engine.dirty_files().is_empty());
        assert_eq!(engine.get_files(&words, &key("hello"), ReadPolicy::FailFast).unwrap(), vec![file]);
        assert_eq!(engine.get_files(&lengths, &11, ReadPolicy::FailFast).unwrap(), vec![file]);

        source.delete(file);
        engine.record_event(file, ChangeFlags::CONTENT_CHANGED).unwrap();
        engine.record_event(file, ChangeFlags::REMOVED).unwrap();
        let report = engine.process_changes(&source, &ctx).unwrap();
        assert_eq!(report.removed, 1);
        assert!(engine.get_files(&words, &key("hello"), ReadPolicy::FailFast).unwrap().is_empty());
        assert_eq!(engine.indexing_stamp(&words, file).unwrap(), IndexingStamp::Unindexed);
    }

    #[test]
    fn unchanged_content_is_skipped() {
        let temp = tempdir().unwrap();
        let (engine, _, _) = open(temp.path());
        let ctx = TaskContext::new();
        let content = FileContent::persisted(&b"same text"[..]);

        assert_eq!(engine.index_file(FileId::new(1), &content, &ctx).unwrap(), 2);
        assert_eq!(engine.index_file(FileId::new(1), &content, &ctx).unwrap(), 0);
        assert_eq!(engine.invalidate_file(FileId::new(1)).unwrap(), 2);
        assert_eq!(engine.index_file(FileId::new(1), &content, &ctx).unwrap(), 2);
    }

    #[test]
    fn failed_change_stays_dirty() {
        struct Broken;
        impl ContentSource for Broken {
            fn content(&self, _: FileId) -> Result<Option<FileContent>, ContentError> {
                Err(ContentError::new("disk unplugged"))
            }
        }

        let temp = tempdir().unwrap();
        let (engine, _, _) = open(temp.path());
        engine.record_event(FileId::new(7), ChangeFlags::CONTENT_CHANGED).unwrap();
        let report = engine.process_changes(&Broken, &TaskContext::new()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(engine.dirty_files(), vec![FileId::new(7)]);
    }

    #[test]
    fn speculative_content_is_discarded_after_scope() {
        let temp = tempdir().unwrap();
        let (engine, words, _) = open(temp.path());
        let ctx = TaskContext::new();
        let file = FileId::new(2);
        engine
            .index_file(file, &FileContent::persisted(&b"saved"[..]), &ctx)
            .unwrap();

        {
            let _scope = engine.enter_buffering(BufferMode::Buffered).unwrap();
            engine
                .index_file(file, &FileContent::speculative(&b"typing"[..]), &ctx)
                .unwrap();
            assert_eq!(engine.get_files(&words, &key("typing"), ReadPolicy::FailFast).unwrap(), vec![file]);
        }

        assert!(engine.get_files(&words, &key("typing"), ReadPolicy::FailFast).unwrap().is_empty());
        assert_eq!(engine.get_files(&words, &key("saved"), ReadPolicy::FailFast).unwrap(), vec![file]);
        assert_eq!(engine.indexing_stamp(&words, file).unwrap(), IndexingStamp::UpToDate);
    }

    #[test]
    fn speculative_content_without_scope_is_not_kept() {
        let temp = tempdir().unwrap();
        let (engine, words, _) = open(temp.path());
        let ctx = TaskContext::new();
        let file = FileId::new(3);

        let updated = engine
            .index_file(file, &FileContent::speculative(&b"unsaved"[..]), &ctx)
            .unwrap();
        assert!(updated > 0);
        assert_eq!(engine.gate.occupancy(), 0);
        assert!(engine.get_files(&words, &key("unsaved"), ReadPolicy::FailFast).unwrap().is_empty());
        assert_eq!(engine.indexing_stamp(&words, file).unwrap(), IndexingStamp::Unindexed);
    }

    #[test]
    fn request_rebuild_clears_index() {
        let temp = tempdir().unwrap();
        let (engine, words, lengths) = open(temp.path());
        let ctx = TaskContext::new();
        engine
            .index_file(FileId::new(1), &FileContent::persisted(&b"gone"[..]), &ctx)
            .unwrap();

        assert_eq!(engine.request_rebuild("words").unwrap(), RebuildOutcome::Performed);
        assert_eq!(engine.status("words").unwrap(), RebuildStatus::Ok);
        assert!(engine.get_files(&words, &key("gone"), ReadPolicy::FailFast).unwrap().is_empty());
        assert_eq!(engine.get_files(&lengths, &4, ReadPolicy::FailFast).unwrap(), vec![FileId::new(1)]);
        assert_eq!(engine.stats().rebuilds(), 1);
        assert!(matches!(engine.request_rebuild("nope"), Err(CoreError::UnknownIndex { .. })));
    }

    #[test]
    fn process_keys_filters_and_stops() {
        let temp = tempdir().unwrap();
        let (engine, words, _) = open(temp.path());
        let ctx = TaskContext::new();
        engine
            .index_file(FileId::new(1), &FileContent::persisted(&b"apple avocado banana"[..]), &ctx)
            .unwrap();
        engine
            .index_file(FileId::new(2), &FileContent::persisted(&b"apricot"[..]), &ctx)
            .unwrap();

        let mut seen = Vec::new();
        let filter = |file: FileId| file == FileId::new(1);
        let visited = engine
            .process_keys(
                &words,
                |k: &String| k.starts_with('a'),
                Some(&filter),
                &ctx,
                ReadPolicy::FailFast,
                |k: &String, _: &ValueContainer<()>| {
                    seen.push(k.clone());
                    true
                },
            )
            .unwrap();
        assert_eq!(visited, 2);
        assert_eq!(seen, vec![key("apple"), key("avocado")]);
    }

    #[test]
    fn data_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let (engine, _, _) = open(temp.path());
            engine
                .index_file(FileId::new(3), &FileContent::persisted(&b"kept"[..]), &TaskContext::new())
                .unwrap();
            engine.close().unwrap();
            assert!(matches!(engine.flush_all(), Err(CoreError::EngineClosed)));
        }

        let (engine, words, _) = open(temp.path());
        assert!(engine
            .registration_report()
            .iter()
            .all(|(_, diff)| *diff == VersionDiff::UpToDate));
        assert_eq!(engine.get_files(&words, &key("kept"), ReadPolicy::FailFast).unwrap(), vec![FileId::new(3)]);
    }

    #[test]
    fn second_engine_on_same_root_is_locked() {
        let temp = tempdir().unwrap();
        let (_engine, _, _) = open(temp.path());
        let result = Engine::open(temp.path(), config(), EngineBuilder::new());
        assert!(matches!(result, Err(CoreError::EngineLocked)));
    }

    #[test]
    fn dirty_files_become_orphans_on_close() {
        let temp = tempdir().unwrap();
        {
            let (engine, _, _) = open(temp.path());
            engine.record_event(FileId::new(4), ChangeFlags::CONTENT_CHANGED).unwrap();
        }

        let (engine, _, _) = open(temp.path());
        assert!(engine.dirty_files().is_empty());
        assert_eq!(engine.recover_orphans().unwrap(), vec![FileId::new(4)]);
        assert!(engine.is_dirty(FileId::new(4)));
    }
}
