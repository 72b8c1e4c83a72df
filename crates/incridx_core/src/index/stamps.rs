//! Per-file indexing stamps.

use super::forward::{file_from_key, file_key};
use crate::error::{CoreError, CoreResult};
use crate::table::LogMap;
use crate::types::{FileId, OUTDATED_STAMP};

/// Stamp and content fingerprint recorded when a file was indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// Creation stamp of the index version the file was indexed under.
    pub stamp: i64,
    /// Fingerprint of the content that was indexed.
    pub fingerprint: u64,
}

impl FileStamp {
    fn encode(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.stamp.to_le_bytes());
        buf[8..].copy_from_slice(&self.fingerprint.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let stamp = i64::from_le_bytes(data.get(..8)?.try_into().ok()?);
        let fingerprint = u64::from_le_bytes(data.get(8..16)?.try_into().ok()?);
        (data.len() == 16).then_some(Self { stamp, fingerprint })
    }
}

/// Table of [`FileStamp`]s keyed by file id. Absent means unindexed.
#[derive(Debug)]
pub struct StampTable {
    table: LogMap,
}

impl StampTable {
    /// Wraps a table log.
    #[must_use]
    pub fn new(table: LogMap) -> Self {
        Self { table }
    }

    /// Reads the stamp of `file`.
    pub fn get(&self, file: FileId) -> CoreResult<Option<FileStamp>> {
        match self.table.get(&file_key(file))? {
            Some(data) => FileStamp::decode(&data)
                .map(Some)
                .ok_or_else(|| CoreError::corruption(self.table.name(), format!("bad stamp for {file}"))),
            None => Ok(None),
        }
    }

    /// Records the stamp of `file`.
    pub fn set(&self, file: FileId, stamp: FileStamp) -> CoreResult<()> {
        if self.get(file)? == Some(stamp) {
            return Ok(());
        }
        self.table.put(&file_key(file), &stamp.encode())
    }

    /// Marks `file` unindexed.
    pub fn remove(&self, file: FileId) -> CoreResult<()> {
        self.table.remove(&file_key(file))?;
        Ok(())
    }

    /// Marks `file` outdated. Returns false if it was unindexed.
    pub fn invalidate(&self, file: FileId) -> CoreResult<bool> {
        match self.get(file)? {
            Some(current) => {
                self.set(
                    file,
                    FileStamp {
                        stamp: OUTDATED_STAMP,
                        fingerprint: current.fingerprint,
                    },
                )?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Marks every indexed file outdated. Returns the number of files.
    pub fn invalidate_all(&self) -> CoreResult<usize> {
        let files = self.files()?;
        for &file in &files {
            self.invalidate(file)?;
        }
        Ok(files.len())
    }

    /// Returns every file with a stamp.
    pub fn files(&self) -> CoreResult<Vec<FileId>> {
        let mut files = self
            .table
            .keys()
            .iter()
            .map(|raw| file_from_key(raw))
            .collect::<CoreResult<Vec<_>>>()?;
        files.sort_unstable();
        Ok(files)
    }

    /// Syncs the table log.
    pub fn flush(&self) -> CoreResult<()> {
        self.table.flush()
    }

    /// Deletes all stamps.
    pub fn clear(&self) -> CoreResult<()> {
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

    #[test]
    fn stamp_lifecycle() {
        let stamps = StampTable::new(LogMap::in_memory("stamps"));
        let file = FileId(4);
        assert_eq!(stamps.get(file).unwrap(), None);
        assert!(!stamps.invalidate(file).unwrap());

        let stamp = FileStamp {
            stamp: 1_000,
            fingerprint: 0xfeed,
        };
        stamps.set(file, stamp).unwrap();
        assert_eq!(stamps.get(file).unwrap(), Some(stamp));

        assert!(stamps.invalidate(file).unwrap());
        let invalidated = stamps.get(file).unwrap().unwrap();
        assert_eq!(invalidated.stamp, OUTDATED_STAMP);
        assert_eq!(invalidated.fingerprint, 0xfeed);

        stamps.remove(file).unwrap();
        assert_eq!(stamps.get(file).unwrap(), None);
    }

    #[test]
    fn invalidate_all_touches_every_file() {
        let stamps = StampTable::new(LogMap::in_memory("stamps"));
        for id in 0..5 {
            stamps
                .set(FileId(id), FileStamp { stamp: 9, fingerprint: 0 })
                .unwrap();
        }
        assert_eq!(stamps.invalidate_all().unwrap(), 5);
        assert!(stamps
            .files()
            .unwrap()
            .into_iter()
            .all(|f| stamps.get(f).unwrap().unwrap().stamp == OUTDATED_STAMP));
    }

    #[test]
    fn setting_same_stamp_does_not_append() {
        let stamps = StampTable::new(LogMap::in_memory("stamps"));
        let stamp = FileStamp { stamp: 3, fingerprint: 3 };
        stamps.set(FileId(1), stamp).unwrap();
        stamps.set(FileId(1), stamp).unwrap();
        assert_eq!(stamps.table().garbage_ratio(), 0.0);
    }
}
