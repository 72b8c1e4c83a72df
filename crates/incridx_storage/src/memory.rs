//! In-memory storage backend for tests and scratch tables.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;

/// The flavor of an injected I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fails with `ErrorKind::Interrupted`, which callers may retry.
    Transient,
    /// Fails with `ErrorKind::Other`, which callers must not retry.
    Permanent,
}

impl FaultKind {
    fn to_error(self, op: &str) -> StorageError {
        let kind = match self {
            Self::Transient => io::ErrorKind::Interrupted,
            Self::Permanent => io::ErrorKind::Other,
        };
        StorageError::Io(io::Error::new(kind, format!("injected {op} failure")))
    }
}

#[derive(Debug, Default)]
struct Faults {
    writes: Option<(FaultKind, usize)>,
    reads: Option<(FaultKind, usize)>,
}

impl Faults {
    fn take(slot: &mut Option<(FaultKind, usize)>) -> Option<FaultKind> {
        let (kind, remaining) = slot.as_mut()?;
        let kind = *kind;
        *remaining -= 1;
        if *remaining == 0 {
            *slot = None;
        }
        Some(kind)
    }
}

/// An in-memory storage backend.
///
/// Cloning yields a second handle onto the same bytes, which lets a test
/// keep inspecting (or sabotaging) a backend after handing it to a table.
///
/// # Example
///
/// ```rust
/// use incridx_storage::{FaultKind, InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let view = backend.clone();
/// view.fail_next_writes(FaultKind::Permanent, 1);
/// assert!(backend.append(b"lost").is_err());
/// assert_eq!(backend.append(b"kept").unwrap(), 0);
/// assert_eq!(view.data(), b"kept");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing bytes.
    ///
    /// Useful for replaying hand-crafted or truncated logs.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            faults: Arc::default(),
        }
    }

    /// Returns a copy of all stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes the next `count` mutating calls (append, flush, sync, truncate) fail.
    pub fn fail_next_writes(&self, kind: FaultKind, count: usize) {
        if count > 0 {
            self.faults.lock().writes = Some((kind, count));
        }
    }

    /// Makes the next `count` reads fail.
    pub fn fail_next_reads(&self, kind: FaultKind, count: usize) {
        if count > 0 {
            self.faults.lock().reads = Some((kind, count));
        }
    }

    fn check_write(&self, op: &str) -> StorageResult<()> {
        match Faults::take(&mut self.faults.lock().writes) {
            Some(kind) => Err(kind.to_error(op)),
            None => Ok(()),
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if let Some(kind) = Faults::take(&mut self.faults.lock().reads) {
            return Err(kind.to_error("read"));
        }

        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        self.check_write("append")?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_write("flush")
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_write("sync")
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_write("truncate")?;
        let mut data = self.data.write();
        let current_size = data.len() as u64;

        if new_size > current_size {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, current_size
                ),
            )));
        }

        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn memory_read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn memory_clone_shares_bytes() {
        let mut backend = InMemoryBackend::new();
        let view = backend.clone();
        backend.append(b"shared").unwrap();
        assert_eq!(view.data(), b"shared");
    }

    #[test]
    fn memory_truncate() {
        let mut backend = InMemoryBackend::with_data(b"hello world".to_vec());
        backend.truncate(5).unwrap();
        assert_eq!(backend.read_to_end(0).unwrap(), b"hello");
        assert!(backend.truncate(100).is_err());
    }

    #[test]
    fn injected_write_faults_expire() {
        let mut backend = InMemoryBackend::new();
        backend.fail_next_writes(FaultKind::Transient, 2);

        let err = backend.append(b"a").unwrap_err();
        assert!(err.is_transient());
        assert!(backend.flush().is_err());
        assert!(backend.append(b"b").is_ok());
        assert_eq!(backend.data(), b"b");
    }

    #[test]
    fn injected_read_fault_is_permanent() {
        let backend = InMemoryBackend::with_data(b"abc".to_vec());
        backend.fail_next_reads(FaultKind::Permanent, 1);

        let err = backend.read_at(0, 3).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(backend.read_at(0, 3).unwrap(), b"abc");
    }
}
