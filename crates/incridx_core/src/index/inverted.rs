//! Inverted (Entry) storage: key → values → files.

use super::container::ValueContainer;
use crate::buffering::BufferMode;
use crate::cancel::TaskContext;
use crate::codec::{IndexKey, IndexValue};
use crate::error::{CoreError, CoreResult};
use crate::table::LogMap;
use crate::types::FileId;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use tracing::trace;

#[derive(Debug)]
struct CachedEntry<V> {
    container: ValueContainer<V>,
    dirty: bool,
}

/// Filter on file ids used to restrict a key scan.
pub type IdFilter<'a> = &'a dyn Fn(FileId) -> bool;

/// Persistent key → [`ValueContainer`] map with an LRU cache in front.
///
/// Mutations land in the cache and are marked dirty; a dirty entry reaches
/// the table log when it is evicted or when the storage is flushed. Buffered
/// mutations go to a separate overlay that reads consult first and that is
/// dropped, never written, by [`InvertedStorage::discard_buffered`].
#[derive(Debug)]
pub struct InvertedStorage<K: IndexKey, V: IndexValue> {
    table: LogMap,
    cache: Mutex<LruCache<K, CachedEntry<V>>>,
    overlay: Mutex<HashMap<K, ValueContainer<V>>>,
}

impl<K: IndexKey, V: IndexValue> InvertedStorage<K, V> {
    /// Wraps a table log with a cache of `cache_capacity` keys.
    #[must_use]
    pub fn new(table: LogMap, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            table,
            cache: Mutex::new(LruCache::new(capacity)),
            overlay: Mutex::new(HashMap::new()),
        }
    }

    fn load(&self, key: &K) -> CoreResult<ValueContainer<V>> {
        match self.table.get(&key.to_bytes()?)? {
            Some(data) => ValueContainer::decode(&data)
                .map_err(|e| CoreError::corruption(self.table.name(), e.to_string())),
            None => Ok(ValueContainer::new()),
        }
    }

    fn write_back(&self, key: &K, container: &ValueContainer<V>) -> CoreResult<()> {
        let raw_key = key.to_bytes()?;
        if container.is_empty() {
            self.table.remove(&raw_key)?;
        } else {
            self.table.put(&raw_key, &container.encode()?)?;
        }
        Ok(())
    }

    /// Applies `mutate` to the container of `key`, returning its result.
    fn modify<R>(
        &self,
        key: &K,
        mode: BufferMode,
        mutate: impl FnOnce(&mut ValueContainer<V>) -> (R, bool),
    ) -> CoreResult<R> {
        if mode == BufferMode::Buffered {
            let mut overlay = self.overlay.lock();
            if !overlay.contains_key(key) {
                let base = self.read_persistent(key)?;
                overlay.insert(key.clone(), base);
            }
            let container = overlay
                .get_mut(key)
                .ok_or_else(|| CoreError::corruption(self.table.name(), "overlay entry vanished"))?;
            return Ok(mutate(container).0);
        }

        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get_mut(key) {
            let (result, changed) = mutate(&mut entry.container);
            entry.dirty |= changed;
            return Ok(result);
        }

        let mut container = self.load(key)?;
        let (result, changed) = mutate(&mut container);
        let evicted = cache.push(
            key.clone(),
            CachedEntry {
                container,
                dirty: changed,
            },
        );
        if let Some((evicted_key, entry)) = evicted {
            if entry.dirty && evicted_key != *key {
                trace!(table = self.table.name(), key = ?evicted_key, "writing back evicted entry");
                self.write_back(&evicted_key, &entry.container)?;
            }
        }
        Ok(result)
    }

    /// Associates `file` with `value` under `key`.
    ///
    /// Idempotent: re-adding an existing association changes nothing.
    pub fn add_value(&self, key: &K, file: FileId, value: V, mode: BufferMode) -> CoreResult<()> {
        self.modify(key, mode, |container| {
            let changed = container.add_value(file, value);
            ((), changed)
        })
    }

    /// Removes the association of `file` under `key`.
    pub fn remove_associated_value(&self, key: &K, file: FileId, mode: BufferMode) -> CoreResult<bool> {
        self.modify(key, mode, |container| {
            let removed = container.remove_associated_value(file);
            (removed, removed)
        })
    }

    fn read_persistent(&self, key: &K) -> CoreResult<ValueContainer<V>> {
        if let Some(entry) = self.cache.lock().get(key) {
            return Ok(entry.container.clone());
        }

        let container = self.load(key)?;
        let mut cache = self.cache.lock();
        if !cache.contains(key) {
            let evicted = cache.push(
                key.clone(),
                CachedEntry {
                    container: container.clone(),
                    dirty: false,
                },
            );
            if let Some((evicted_key, entry)) = evicted {
                if entry.dirty {
                    self.write_back(&evicted_key, &entry.container)?;
                }
            }
        }
        Ok(container)
    }

    /// Reads the container of `key`, preferring buffered state.
    pub fn read(&self, key: &K) -> CoreResult<ValueContainer<V>> {
        if let Some(container) = self.overlay.lock().get(key) {
            return Ok(container.clone());
        }
        self.read_persistent(key)
    }

    /// Returns every key with at least one association, in ascending order.
    pub fn keys(&self) -> CoreResult<Vec<K>> {
        let mut keys = BTreeSet::new();
        for raw in self.table.keys() {
            keys.insert(K::from_bytes(&raw)?);
        }
        for (key, entry) in self.cache.lock().iter() {
            if entry.container.is_empty() {
                keys.remove(key);
            } else {
                keys.insert(key.clone());
            }
        }
        for (key, container) in self.overlay.lock().iter() {
            if container.is_empty() {
                keys.remove(key);
            } else {
                keys.insert(key.clone());
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Visits keys matching `predicate` in ascending order.
    ///
    /// With an `id_filter`, only keys that have at least one file passing the
    /// filter are visited. The processor returns false to stop early. The
    /// task's cancellation token is polled every `batch_size` keys.
    ///
    /// Returns the number of keys handed to the processor.
    pub fn process_keys(
        &self,
        predicate: &dyn Fn(&K) -> bool,
        id_filter: Option<IdFilter<'_>>,
        ctx: &TaskContext,
        batch_size: usize,
        processor: &mut dyn FnMut(&K, &ValueContainer<V>) -> bool,
    ) -> CoreResult<usize> {
        let batch_size = batch_size.max(1);
        let mut visited = 0;

        for (scanned, key) in self.keys()?.into_iter().enumerate() {
            if scanned % batch_size == 0 {
                ctx.check_cancelled()?;
            }
            if !predicate(&key) {
                continue;
            }
            let container = self.read(&key)?;
            if let Some(filter) = id_filter {
                if !container.files().into_iter().any(|file| filter(file)) {
                    continue;
                }
            }
            visited += 1;
            if !processor(&key, &container) {
                break;
            }
        }
        Ok(visited)
    }

    /// Returns true if any cached entry awaits write-back.
    #[must_use]
    pub fn has_dirty_entries(&self) -> bool {
        self.cache.lock().iter().any(|(_, entry)| entry.dirty)
    }

    /// Writes dirty cache entries to the table log and syncs it.
    ///
    /// Returns the number of entries written.
    pub fn flush(&self) -> CoreResult<usize> {
        let mut cache = self.cache.lock();
        let mut written = 0;
        for (key, entry) in cache.iter_mut() {
            if entry.dirty {
                self.write_back(key, &entry.container)?;
                entry.dirty = false;
                written += 1;
            }
        }
        drop(cache);
        self.table.flush()?;
        Ok(written)
    }

    /// Drops the buffered overlay.
    pub fn discard_buffered(&self) {
        self.overlay.lock().clear();
    }

    /// Deletes all persistent and cached data.
    pub fn clear(&self) -> CoreResult<()> {
        self.cache.lock().clear();
        self.overlay.lock().clear();
        self.table.clear()
    }

    /// Returns the backing table log.
    #[must_use]
    pub fn table(&self) -> &LogMap {
        &self.table
    }
}
