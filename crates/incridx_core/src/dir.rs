//! Engine directory management.
//!
//! ```text
//! <root>/
//! ├─ LOCK                  # Advisory lock, one engine per root
//! ├─ MANIFEST              # Format version, storage epoch, index registry
//! ├─ dirty/
//! │   ├─ orphans.queue     # Dirty files nobody reconciled before shutdown
//! │   └─ <partition>.queue # Per-partition dirty files
//! └─ indices/<name>/
//!     ├─ version           # IndexVersion record
//!     ├─ entries.log       # Inverted table
//!     ├─ forward.log       # Forward table
//!     ├─ stamps.log        # Per-file stamps
//!     └─ DIRTY             # Present while cached state is unflushed
//! ```

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const INDICES_DIR: &str = "indices";
const DIRTY_DIR: &str = "dirty";
const ORPHAN_QUEUE_FILE: &str = "orphans.queue";
const VERSION_FILE: &str = "version";
const ENTRIES_FILE: &str = "entries.log";
const FORWARD_FILE: &str = "forward.log";
const STAMPS_FILE: &str = "stamps.log";
const DIRTY_MARKER: &str = "DIRTY";

/// Rejects names that cannot be used verbatim as a directory or file name.
pub(crate) fn validate_name(kind: &str, name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid_format(format!(
            "invalid {kind} name {name:?}: use ASCII letters, digits, '_', '-' or '.'"
        )))
    }
}

/// Writes `data` to `path` through a synced temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Reads a whole file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    // NTFS journals metadata; directories cannot be opened for sync.
    Ok(())
}

/// The engine root directory, held under an exclusive lock.
///
/// Only one `EngineDir` can exist per root at a time; a second open from
/// this or another process fails with [`CoreError::EngineLocked`].
#[derive(Debug)]
pub struct EngineDir {
    path: PathBuf,
    _lock_file: File,
}

impl EngineDir {
    /// Opens or creates an engine root.
    ///
    /// # Errors
    ///
    /// Fails if the root is missing and `create_if_missing` is false, if the
    /// path is not a directory, or if another engine holds the lock.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "engine directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::EngineLocked);
        }

        fs::create_dir_all(path.join(INDICES_DIR))?;
        fs::create_dir_all(path.join(DIRTY_DIR))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the root path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Loads the manifest, or `None` for a fresh root.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        match read_optional(&self.manifest_path())? {
            Some(data) if !data.is_empty() => Ok(Some(Manifest::decode(&data)?)),
            _ => Ok(None),
        }
    }

    /// Saves the manifest atomically (temp file, fsync, rename, fsync dir).
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        write_atomic(&self.manifest_path(), &manifest.encode())?;
        Ok(())
    }

    /// Returns the directory holding one index's files.
    #[must_use]
    pub fn index_dir(&self, name: &str) -> PathBuf {
        self.path.join(INDICES_DIR).join(name)
    }

    /// Creates an index's directory if needed.
    pub fn ensure_index_dir(&self, name: &str) -> CoreResult<PathBuf> {
        let dir = self.index_dir(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Path of an index's version record.
    #[must_use]
    pub fn version_path(&self, name: &str) -> PathBuf {
        self.index_dir(name).join(VERSION_FILE)
    }

    /// Path of an index's inverted table.
    #[must_use]
    pub fn entries_path(&self, name: &str) -> PathBuf {
        self.index_dir(name).join(ENTRIES_FILE)
    }

    /// Path of an index's forward table.
    #[must_use]
    pub fn forward_path(&self, name: &str) -> PathBuf {
        self.index_dir(name).join(FORWARD_FILE)
    }

    /// Path of an index's stamp table.
    #[must_use]
    pub fn stamps_path(&self, name: &str) -> PathBuf {
        self.index_dir(name).join(STAMPS_FILE)
    }

    fn dirty_marker_path(&self, name: &str) -> PathBuf {
        self.index_dir(name).join(DIRTY_MARKER)
    }

    /// Returns true if the index was left with unflushed state.
    #[must_use]
    pub fn is_marked_dirty(&self, name: &str) -> bool {
        self.dirty_marker_path(name).exists()
    }

    /// Records that the index has cached state not yet on disk.
    pub fn mark_dirty(&self, name: &str) -> CoreResult<()> {
        let path = self.dirty_marker_path(name);
        if !path.exists() {
            File::create(&path)?.sync_all()?;
        }
        Ok(())
    }

    /// Removes the dirty marker after a complete flush.
    pub fn clear_dirty(&self, name: &str) -> CoreResult<()> {
        match fs::remove_file(self.dirty_marker_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every file of an index and recreates its empty directory.
    pub fn wipe_index(&self, name: &str) -> CoreResult<()> {
        let dir = self.index_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&dir)?;
        sync_dir(&self.path.join(INDICES_DIR))?;
        Ok(())
    }

    /// Path of the orphan dirty-file queue.
    #[must_use]
    pub fn orphan_queue_path(&self) -> PathBuf {
        self.path.join(DIRTY_DIR).join(ORPHAN_QUEUE_FILE)
    }

    /// Path of a partition's dirty-file queue.
    #[must_use]
    pub fn partition_queue_path(&self, partition: &str) -> PathBuf {
        self.path.join(DIRTY_DIR).join(format!("{partition}.queue"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("engine");

        let dir = EngineDir::open(&root, true).unwrap();
        assert!(root.join("indices").is_dir());
        assert!(root.join("dirty").is_dir());
        assert_eq!(dir.entries_path("words"), root.join("indices/words/entries.log"));
        assert_eq!(dir.orphan_queue_path(), root.join("dirty/orphans.queue"));
        assert_eq!(dir.partition_queue_path("app"), root.join("dirty/app.queue"));
    }

    #[test]
    fn open_fails_if_missing_and_no_create() {
        let temp = tempdir().unwrap();
        assert!(EngineDir::open(&temp.path().join("missing"), false).is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = EngineDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            EngineDir::open(temp.path(), true),
            Err(CoreError::EngineLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(EngineDir::open(temp.path(), true).unwrap());
        EngineDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn manifest_save_and_load() {
        let temp = tempdir().unwrap();
        let dir = EngineDir::open(temp.path(), true).unwrap();
        assert!(dir.load_manifest().unwrap().is_none());

        let mut manifest = Manifest::new((1, 0), 99);
        manifest.get_or_create_index("words");
        dir.save_manifest(&manifest).unwrap();

        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
        assert!(!temp.path().join("MANIFEST.tmp").exists());
    }

    #[test]
    fn dirty_marker_and_wipe() {
        let temp = tempdir().unwrap();
        let dir = EngineDir::open(temp.path(), true).unwrap();
        dir.ensure_index_dir("words").unwrap();
        fs::write(dir.entries_path("words"), b"data").unwrap();

        dir.mark_dirty("words").unwrap();
        assert!(dir.is_marked_dirty("words"));
        dir.clear_dirty("words").unwrap();
        dir.clear_dirty("words").unwrap();
        assert!(!dir.is_marked_dirty("words"));

        dir.wipe_index("words").unwrap();
        assert!(dir.index_dir("words").is_dir());
        assert!(!dir.entries_path("words").exists());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("index", "word-index_v2.1").is_ok());
        assert!(validate_name("index", "").is_err());
        assert!(validate_name("index", "..").is_err());
        assert!(validate_name("index", "a/b").is_err());
        assert!(validate_name("partition", "with space").is_err());
    }
}
