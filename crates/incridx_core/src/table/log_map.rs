//! Log-structured key/value map over a storage backend.

use super::record::{RecordOp, Scan, TableRecord};
use crate::error::{CoreError, CoreResult};
use incridx_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where a table's bytes live, which decides how it is compacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLocation {
    /// A file; compaction writes a scratch file and renames it over this path.
    File(PathBuf),
    /// Process memory; compaction swaps in a fresh in-memory backend.
    Memory,
}

/// Location of a live record inside the log.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: usize,
}

#[derive(Debug, Default)]
struct Directory {
    slots: HashMap<Vec<u8>, Slot>,
    live_bytes: u64,
    total_bytes: u64,
}

impl Directory {
    fn apply(&mut self, op: RecordOp, key: &[u8], slot: Slot) {
        self.total_bytes += slot.len as u64;
        match op {
            RecordOp::Put => {
                self.live_bytes += slot.len as u64;
                if let Some(old) = self.slots.insert(key.to_vec(), slot) {
                    self.live_bytes -= old.len as u64;
                }
            }
            RecordOp::Remove => {
                if let Some(old) = self.slots.remove(key) {
                    self.live_bytes -= old.len as u64;
                }
            }
        }
    }
}

/// An append-only key/value map.
///
/// Writes append a checksummed record; an in-memory directory maps every
/// live key to the offset of its latest `Put`. Reads fetch and verify that
/// record from the backend, so a cold key costs one backend read.
///
/// # Recovery
///
/// Opening replays the log. A record cut short at the end of the log is a
/// torn write from a crash and is truncated away; a malformed record
/// anywhere else is reported as corruption.
///
/// # Thread Safety
///
/// Readers share the backend through a read lock and never block each
/// other; appends take the write lock.
pub struct LogMap {
    name: String,
    location: TableLocation,
    backend: RwLock<Box<dyn StorageBackend>>,
    directory: RwLock<Directory>,
}

impl std::fmt::Debug for LogMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMap")
            .field("name", &self.name)
            .field("location", &self.location)
            .field("len", &self.len())
            .finish()
    }
}

impl LogMap {
    /// Opens (or creates) a file-backed table and replays it.
    pub fn open_file(name: impl Into<String>, path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::open(name, Box::new(backend), TableLocation::File(path.to_path_buf()))
    }

    /// Creates an empty in-memory table.
    #[must_use]
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: TableLocation::Memory,
            backend: RwLock::new(Box::new(InMemoryBackend::new())),
            directory: RwLock::new(Directory::default()),
        }
    }

    /// Opens a table over an arbitrary backend and replays it.
    pub fn open(
        name: impl Into<String>,
        mut backend: Box<dyn StorageBackend>,
        location: TableLocation,
    ) -> CoreResult<Self> {
        let name = name.into();
        let directory = Self::replay(&name, backend.as_mut())?;
        Ok(Self {
            name,
            location,
            backend: RwLock::new(backend),
            directory: RwLock::new(directory),
        })
    }

    fn replay(name: &str, backend: &mut dyn StorageBackend) -> CoreResult<Directory> {
        let data = backend.read_to_end(0)?;
        let mut directory = Directory::default();
        let mut offset = 0usize;

        while offset < data.len() {
            let scanned = TableRecord::scan(&data[offset..])
                .map_err(|e| CoreError::corruption(name, format!("at offset {offset}: {e}")))?;
            match scanned {
                Scan::Record(record, len) => {
                    directory.apply(
                        record.op,
                        record.key,
                        Slot {
                            offset: offset as u64,
                            len,
                        },
                    );
                    offset += len;
                }
                Scan::Incomplete => {
                    warn!(
                        table = name,
                        offset,
                        discarded = data.len() - offset,
                        "truncating torn tail of table log"
                    );
                    backend.truncate(offset as u64)?;
                    break;
                }
            }
        }

        debug!(table = name, keys = directory.slots.len(), bytes = offset, "replayed table log");
        Ok(directory)
    }

    /// Returns the table's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.directory.read().slots.len()
    }

    /// Returns true if the table has no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `key` is live.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.directory.read().slots.contains_key(key)
    }

    /// Reads the latest value stored under `key`.
    ///
    /// The backend lock is taken before the directory lock and held across
    /// the read, so a concurrent [`LogMap::compact`] cannot swap the log
    /// between looking up the slot and reading it.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let backend = self.backend.read();
        let Some(slot) = self.directory.read().slots.get(key).copied() else {
            return Ok(None);
        };

        let data = backend.read_at(slot.offset, slot.len)?;
        drop(backend);
        let record = TableRecord::decode_exact(&data).map_err(|e| {
            CoreError::corruption(&self.name, format!("at offset {}: {e}", slot.offset))
        })?;
        if record.op != RecordOp::Put || record.key != key {
            return Err(CoreError::corruption(
                &self.name,
                format!("directory points at a foreign record at offset {}", slot.offset),
            ));
        }
        Ok(Some(record.value.to_vec()))
    }

    /// Stores `value` under `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.append(RecordOp::Put, key, value)
    }

    /// Removes `key`, returning whether it was live.
    pub fn remove(&self, key: &[u8]) -> CoreResult<bool> {
        if !self.contains_key(key) {
            return Ok(false);
        }
        self.append(RecordOp::Remove, key, &[])?;
        Ok(true)
    }

    fn append(&self, op: RecordOp, key: &[u8], value: &[u8]) -> CoreResult<()> {
        let encoded = TableRecord::encode(op, key, value)?;
        let mut backend = self.backend.write();
        let offset = backend.append(&encoded)?;
        self.directory.write().apply(
            op,
            key,
            Slot {
                offset,
                len: encoded.len(),
            },
        );
        Ok(())
    }

    /// Returns a snapshot of all live keys, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.directory.read().slots.keys().cloned().collect()
    }

    /// Pushes appended records to the OS and syncs them to disk.
    pub fn flush(&self) -> CoreResult<()> {
        let mut backend = self.backend.write();
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }

    /// Removes every record.
    pub fn clear(&self) -> CoreResult<()> {
        let mut backend = self.backend.write();
        backend.truncate(0)?;
        *self.directory.write() = Directory::default();
        Ok(())
    }

    /// Share of the log's bytes occupied by superseded records and tombstones.
    #[must_use]
    pub fn garbage_ratio(&self) -> f64 {
        let dir = self.directory.read();
        if dir.total_bytes == 0 {
            return 0.0;
        }
        (dir.total_bytes - dir.live_bytes) as f64 / dir.total_bytes as f64
    }

    /// Rewrites the log with only live records.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn compact(&self) -> CoreResult<u64> {
        let mut backend = self.backend.write();
        let mut directory = self.directory.write();

        let mut rewritten = Vec::with_capacity(directory.live_bytes as usize);
        let mut slots = HashMap::with_capacity(directory.slots.len());
        for (key, slot) in &directory.slots {
            let record = backend.read_at(slot.offset, slot.len)?;
            slots.insert(
                key.clone(),
                Slot {
                    offset: rewritten.len() as u64,
                    len: record.len(),
                },
            );
            rewritten.extend_from_slice(&record);
        }

        let replacement: Box<dyn StorageBackend> = match &self.location {
            TableLocation::File(path) => {
                let mut scratch_name = path.as_os_str().to_owned();
                scratch_name.push(".compact");
                let mut scratch = FileBackend::create_empty(Path::new(&scratch_name))?;
                scratch.append(&rewritten)?;
                Box::new(scratch.persist_as(path)?)
            }
            TableLocation::Memory => Box::new(InMemoryBackend::with_data(rewritten.clone())),
        };

        let reclaimed = directory.total_bytes - rewritten.len() as u64;
        *backend = replacement;
        *directory = Directory {
            slots,
            live_bytes: rewritten.len() as u64,
            total_bytes: rewritten.len() as u64,
        };

        debug!(table = %self.name, reclaimed, "compacted table log");
        Ok(reclaimed)
    }
}
