//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store underneath every incridx table.
///
/// Backends are **opaque byte stores**. The engine's table logs append
/// encoded records and read them back by offset; the backend never looks
/// inside them.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `read_at` takes `&self` and must not serialize concurrent readers
/// - `flush` pushes appended data to the OS, `sync` makes it durable
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends beyond the current size or an
    /// I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes all appended data to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is where the next `append` lands.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// Used to cut a torn tail after a crash and to clear a table during
    /// an index rebuild.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads everything from `offset` to the current end.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined or the read fails.
    fn read_to_end(&self, offset: u64) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = usize::try_from(size - offset).map_err(|_| {
            crate::StorageError::Corrupted(format!("storage too large to read: {size} bytes"))
        })?;
        self.read_at(offset, len)
    }
}
