//! Forward index: file → keys the file contributes.

use crate::buffering::BufferMode;
use crate::codec::{write_bytes, write_varint, IndexKey, Reader};
use crate::error::{CoreError, CoreResult};
use crate::table::LogMap;
use crate::types::FileId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

pub(crate) fn file_key(file: FileId) -> [u8; 4] {
    file.as_u32().to_be_bytes()
}

pub(crate) fn file_from_key(raw: &[u8]) -> CoreResult<FileId> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| CoreError::invalid_format("file id key must be 4 bytes"))?;
    Ok(FileId(u32::from_be_bytes(bytes)))
}

/// Persistent map from file id to the set of keys it contributes.
///
/// Only the update transaction reads it, to compute which associations a
/// re-indexed file no longer has.
#[derive(Debug)]
pub struct ForwardIndex<K: IndexKey> {
    table: LogMap,
    overlay: Mutex<HashMap<FileId, BTreeSet<K>>>,
}

impl<K: IndexKey> ForwardIndex<K> {
    /// Wraps a table log.
    #[must_use]
    pub fn new(table: LogMap) -> Self {
        Self {
            table,
            overlay: Mutex::new(HashMap::new()),
        }
    }

    fn encode(keys: &BTreeSet<K>) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        write_varint(&mut buf, keys.len() as u64);
        for key in keys {
            write_bytes(&mut buf, &key.to_bytes()?);
        }
        Ok(buf)
    }

    fn decode(&self, data: &[u8]) -> CoreResult<BTreeSet<K>> {
        let corrupt = |e: CoreError| CoreError::corruption(self.table.name(), e.to_string());
        let mut reader = Reader::new(data);
        let count = reader.read_varint("key count").map_err(corrupt)?;
        let mut keys = BTreeSet::new();
        for _ in 0..count {
            let raw = reader.read_bytes("key").map_err(corrupt)?;
            keys.insert(K::from_bytes(raw).map_err(corrupt)?);
        }
        if !reader.is_empty() {
            return Err(CoreError::corruption(self.table.name(), "trailing bytes after key set"));
        }
        Ok(keys)
    }

    /// Returns the keys `file` currently contributes, preferring buffered state.
    pub fn read_input_keys(&self, file: FileId) -> CoreResult<BTreeSet<K>> {
        if let Some(keys) = self.overlay.lock().get(&file) {
            return Ok(keys.clone());
        }
        match self.table.get(&file_key(file))? {
            Some(data) => self.decode(&data),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Replaces the keys of `file`. An empty set deletes the record.
    pub fn write_input_keys(&self, file: FileId, keys: &BTreeSet<K>, mode: BufferMode) -> CoreResult<()> {
        match mode {
            BufferMode::Buffered => {
                self.overlay.lock().insert(file, keys.clone());
            }
            BufferMode::Persistent if keys.is_empty() => {
                self.table.remove(&file_key(file))?;
            }
            BufferMode::Persistent => {
                self.table.put(&file_key(file), &Self::encode(keys)?)?;
            }
        }
        Ok(())
    }

    /// Returns every file with a non-empty key set, in ascending order.
    pub fn files(&self) -> CoreResult<Vec<FileId>> {
        let mut files = BTreeSet::new();
        for raw in self.table.keys() {
            files.insert(file_from_key(&raw)?);
        }
        for (file, keys) in self.overlay.lock().iter() {
            if keys.is_empty() {
                files.remove(file);
            } else {
                files.insert(*file);
            }
        }
        Ok(files.into_iter().collect())
    }

    /// Syncs the table log.
    pub fn flush(&self) -> CoreResult<()> {
        self.table.flush()
    }

    /// Drops the buffered overlay.
    pub fn discard_buffered(&self) {
        self.overlay.lock().clear();
    }

    /// Deletes all data.
    pub fn clear(&self) -> CoreResult<()> {
        self.overlay.lock().clear();
        self.table.clear()
    }

    /// Returns the backing table log.
    #[must_use]
    pub fn table(&self) -> &LogMap {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn write_read_and_delete() {
        let forward = ForwardIndex::<String>::new(LogMap::in_memory("forward"));
        assert!(forward.read_input_keys(FileId(1)).unwrap().is_empty());

        forward
            .write_input_keys(FileId(1), &keys(&["a", "b"]), BufferMode::Persistent)
            .unwrap();
        assert_eq!(forward.read_input_keys(FileId(1)).unwrap(), keys(&["a", "b"]));
        assert_eq!(forward.files().unwrap(), vec![FileId(1)]);

        forward
            .write_input_keys(FileId(1), &BTreeSet::new(), BufferMode::Persistent)
            .unwrap();
        assert!(forward.files().unwrap().is_empty());
        assert!(forward.table().is_empty());
    }

    #[test]
    fn overlay_shadows_table_until_discarded() {
        let forward = ForwardIndex::<String>::new(LogMap::in_memory("forward"));
        forward
            .write_input_keys(FileId(3), &keys(&["x"]), BufferMode::Persistent)
            .unwrap();
        forward
            .write_input_keys(FileId(3), &BTreeSet::new(), BufferMode::Buffered)
            .unwrap();

        assert!(forward.read_input_keys(FileId(3)).unwrap().is_empty());
        assert!(forward.files().unwrap().is_empty());

        forward.discard_buffered();
        assert_eq!(forward.read_input_keys(FileId(3)).unwrap(), keys(&["x"]));
    }

    #[test]
    fn corrupted_record_is_reported() {
        let forward = ForwardIndex::<u32>::new(LogMap::in_memory("forward"));
        forward.table().put(&file_key(FileId(9)), &[2, 4, 0, 0]).unwrap();
        assert!(matches!(
            forward.read_input_keys(FileId(9)),
            Err(CoreError::StorageCorruption { .. })
        ));
    }
}
