//! Dirty-file bookkeeping and its durable queues.

use crate::codec::{crc32, write_varint, Reader};
use crate::dir::{read_optional, write_atomic};
use crate::error::{CoreError, CoreResult};
use crate::types::FileId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

const ORPHAN_MAGIC: [u8; 4] = *b"IXOQ";
const PARTITION_MAGIC: [u8; 4] = *b"IXPQ";
const QUEUE_VERSION: u16 = 1;

const SHARDS: usize = 16;

/// Set of files that still need (re)indexing.
#[derive(Debug)]
pub struct DirtyFileSet {
    shards: Vec<Mutex<HashSet<FileId>>>,
    len: AtomicUsize,
}

impl Default for DirtyFileSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DirtyFileSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashSet::new())).collect(),
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, file: FileId) -> &Mutex<HashSet<FileId>> {
        &self.shards[file.as_u32() as usize % SHARDS]
    }

    /// Marks `file` dirty. Returns false if it already was.
    pub fn mark(&self, file: FileId) -> bool {
        let inserted = self.shard(file).lock().insert(file);
        if inserted {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Clears `file`. Returns false if it was not dirty.
    pub fn unmark(&self, file: FileId) -> bool {
        let removed = self.shard(file).lock().remove(&file);
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Returns true if `file` is dirty.
    #[must_use]
    pub fn contains(&self, file: FileId) -> bool {
        self.shard(file).lock().contains(&file)
    }

    /// Number of dirty files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if no file is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the dirty files in ascending order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FileId> {
        let mut files: Vec<FileId> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().iter().copied().collect::<Vec<_>>())
            .collect();
        files.sort_unstable();
        files
    }
}

/// Decoded contents of a queue file.
struct QueueFile {
    generation: i64,
    position: u64,
    /// Orphan queues only: positions below this were trimmed away.
    trimmed: u64,
    ids: Vec<FileId>,
}

fn encode_queue(magic: [u8; 4], queue: &QueueFile) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + queue.ids.len() * 3);
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&QUEUE_VERSION.to_le_bytes());
    buf.extend_from_slice(&queue.generation.to_le_bytes());
    buf.extend_from_slice(&queue.position.to_le_bytes());
    if magic == ORPHAN_MAGIC {
        buf.extend_from_slice(&queue.trimmed.to_le_bytes());
    }
    write_varint(&mut buf, queue.ids.len() as u64);
    for id in &queue.ids {
        write_varint(&mut buf, u64::from(id.as_u32()));
    }
    let crc = crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_queue(magic: [u8; 4], data: &[u8]) -> CoreResult<QueueFile> {
    if data.len() < 8 {
        return Err(CoreError::invalid_format("queue file too short"));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32(body) != stored_crc {
        return Err(CoreError::invalid_format("queue checksum mismatch"));
    }

    let mut reader = Reader::new(body);
    if reader.take(4, "queue magic")? != magic {
        return Err(CoreError::invalid_format("invalid queue magic"));
    }
    let version = reader.read_u16("queue version")?;
    if version > QUEUE_VERSION {
        return Err(CoreError::invalid_format(format!("unsupported queue version: {version}")));
    }
    let generation = reader.read_i64("queue generation")?;
    let position = reader.read_u64("queue position")?;
    let trimmed = if magic == ORPHAN_MAGIC {
        reader.read_u64("queue trim position")?
    } else {
        0
    };
    let count = reader.read_varint("queue length")?;
    let mut ids = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        let raw = reader.read_varint("file id")?;
        let id = u32::try_from(raw)
            .map_err(|_| CoreError::invalid_format(format!("file id {raw} out of range")))?;
        ids.push(FileId(id));
    }
    if !reader.is_empty() {
        return Err(CoreError::invalid_format("trailing bytes in queue"));
    }
    Ok(QueueFile {
        generation,
        position,
        trimmed,
        ids,
    })
}

/// Where a reader of the orphan queue left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMark {
    /// Generation of the queue the position refers to.
    pub generation: i64,
    /// Absolute position in that queue.
    pub position: u64,
}

/// Durable queue of dirty files that no open partition claimed at shutdown.
///
/// Entries have monotonically increasing absolute positions. A file that is
/// orphaned again is appended at a new position even if an older entry for
/// it is still retained. Entries leave the front of the queue in two ways:
/// [`OrphanQueue::take_all`] hands them to the engine for re-indexing, and
/// trimming drops them when the queue grows past its maximum size. Only
/// trimmed entries are lost, so only a reader whose mark predates the trim
/// position has missed anything.
#[derive(Debug)]
pub struct OrphanQueue {
    path: PathBuf,
    generation: i64,
    start: u64,
    trimmed: u64,
    ids: VecDeque<FileId>,
    max_size: usize,
}

impl OrphanQueue {
    /// Loads the queue at `path`, starting a new generation if it is missing
    /// or unreadable.
    pub fn load(path: &Path, max_size: usize, new_generation: i64) -> CoreResult<Self> {
        let fresh = |path: &Path| Self {
            path: path.to_path_buf(),
            generation: new_generation,
            start: 0,
            trimmed: 0,
            ids: VecDeque::new(),
            max_size: max_size.max(1),
        };

        let Some(data) = read_optional(path)? else {
            return Ok(fresh(path));
        };
        match decode_queue(ORPHAN_MAGIC, &data) {
            Ok(queue) => Ok(Self {
                path: path.to_path_buf(),
                generation: queue.generation,
                start: queue.position,
                trimmed: queue.trimmed.min(queue.position),
                ids: queue.ids.into(),
                max_size: max_size.max(1),
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable orphan queue");
                Ok(fresh(path))
            }
        }
    }

    /// Mark just past the newest entry.
    #[must_use]
    pub fn end(&self) -> QueueMark {
        QueueMark {
            generation: self.generation,
            position: self.start + self.ids.len() as u64,
        }
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Appends files at the tail, trimming the oldest entries past the
    /// maximum size. Returns the number trimmed.
    pub fn push(&mut self, files: impl IntoIterator<Item = FileId>) -> CoreResult<usize> {
        let mut batch = HashSet::new();
        for file in files {
            if batch.insert(file) {
                self.ids.push_back(file);
            }
        }

        let excess = self.ids.len().saturating_sub(self.max_size);
        if excess > 0 {
            self.ids.drain(..excess);
            self.start += excess as u64;
            self.trimmed = self.start;
            info!(trimmed = excess, start = self.start, "trimmed orphan dirty-file queue");
            self.save()?;
        }
        Ok(excess)
    }

    /// Returns the entries since `mark`, and whether entries were missed.
    ///
    /// Entries are missed when `mark` belongs to another generation or
    /// points before the trim position.
    #[must_use]
    pub fn since(&self, mark: QueueMark) -> (Vec<FileId>, bool) {
        let end = self.start + self.ids.len() as u64;
        if mark.generation != self.generation || mark.position > end {
            return (self.ids.iter().copied().collect(), true);
        }
        let missed = mark.position < self.trimmed;
        let skip = mark.position.saturating_sub(self.start) as usize;
        (self.ids.iter().skip(skip).copied().collect(), missed)
    }

    /// Removes and returns every retained entry in queue order, without
    /// duplicates.
    pub fn take_all(&mut self) -> Vec<FileId> {
        self.start += self.ids.len() as u64;
        let mut seen = HashSet::new();
        self.ids.drain(..).filter(|file| seen.insert(*file)).collect()
    }

    /// Writes the queue to disk atomically.
    pub fn save(&self) -> CoreResult<()> {
        let queue = QueueFile {
            generation: self.generation,
            position: self.start,
            trimmed: self.trimmed,
            ids: self.ids.iter().copied().collect(),
        };
        write_atomic(&self.path, &encode_queue(ORPHAN_MAGIC, &queue))?;
        Ok(())
    }
}

/// Saved dirty files of a closed partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionQueue {
    /// Orphan queue mark at the time the partition was closed.
    pub mark: QueueMark,
    /// Files that were dirty when the partition was closed.
    pub dirty: Vec<FileId>,
}

impl PartitionQueue {
    /// Reads a partition queue; `Ok(None)` if it is missing or unreadable.
    pub fn load(path: &Path) -> CoreResult<Option<Self>> {
        let Some(data) = read_optional(path)? else {
            return Ok(None);
        };
        match decode_queue(PARTITION_MAGIC, &data) {
            Ok(queue) => Ok(Some(Self {
                mark: QueueMark {
                    generation: queue.generation,
                    position: queue.position,
                },
                dirty: queue.ids,
            })),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable partition queue");
                Ok(None)
            }
        }
    }

    /// Writes the queue atomically.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let queue = QueueFile {
            generation: self.mark.generation,
            position: self.mark.position,
            trimmed: 0,
            ids: self.dirty.clone(),
        };
        write_atomic(path, &encode_queue(PARTITION_MAGIC, &queue))?;
        Ok(())
    }
}
