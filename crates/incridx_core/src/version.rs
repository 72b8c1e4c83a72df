//! Per-index version records and creation stamps.
//!
//! Every index persists an [`IndexVersion`]. On registration the record is
//! compared against the declared schema version, the engine-wide common
//! version and the storage epoch of the root; any drift forces a rebuild.
//!
//! The creation stamp doubles as the marker written into every per-file
//! stamp. It must never repeat, so a new stamp is always placed at least
//! one resolution unit past the highest stamp the root has ever handed out,
//! even when the wall clock moved backwards between runs.

use crate::codec::{crc32, Reader};
use crate::dir::{read_optional, write_atomic, EngineDir};
use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const VERSION_MAGIC: [u8; 4] = *b"IXVR";
const VERSION_RECORD_VERSION: u16 = 1;
const VERSION_RECORD_SIZE: usize = 4 + 2 + 4 + 4 + 8 + 8 + 4;

/// Format version written into new manifests.
pub const FORMAT_VERSION: (u16, u16) = (1, 0);

/// Source of wall-clock time for creation stamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Persisted version of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexVersion {
    /// Schema version declared by the index definition.
    pub schema_version: u32,
    /// Engine-wide common version (engine version folded with extensions).
    pub engine_version: u32,
    /// Epoch of the storage root the index was built in.
    pub storage_epoch: i64,
    /// Stamp marking records written under this version.
    pub creation_stamp: i64,
}

impl IndexVersion {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VERSION_RECORD_SIZE);
        buf.extend_from_slice(&VERSION_MAGIC);
        buf.extend_from_slice(&VERSION_RECORD_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.schema_version.to_le_bytes());
        buf.extend_from_slice(&self.engine_version.to_le_bytes());
        buf.extend_from_slice(&self.storage_epoch.to_le_bytes());
        buf.extend_from_slice(&self.creation_stamp.to_le_bytes());
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a record written by [`IndexVersion::encode`].
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() != VERSION_RECORD_SIZE {
            return Err(CoreError::invalid_format(format!(
                "version record has {} bytes, expected {VERSION_RECORD_SIZE}",
                data.len()
            )));
        }
        let mut reader = Reader::new(data);
        if reader.take(4, "version magic")? != VERSION_MAGIC {
            return Err(CoreError::invalid_format("invalid version record magic"));
        }
        let record_version = reader.read_u16("record version")?;
        if record_version > VERSION_RECORD_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported version record: {record_version}"
            )));
        }
        let version = Self {
            schema_version: reader.read_u32("schema version")?,
            engine_version: reader.read_u32("engine version")?,
            storage_epoch: reader.read_i64("storage epoch")?,
            creation_stamp: reader.read_i64("creation stamp")?,
        };
        let stored_crc = reader.read_u32("version crc")?;
        if crc32(&data[..VERSION_RECORD_SIZE - 4]) != stored_crc {
            return Err(CoreError::invalid_format("version record checksum mismatch"));
        }
        Ok(version)
    }
}

/// Outcome of comparing a persisted index version with the declared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDiff {
    /// The persisted data matches and can be used as is.
    UpToDate,
    /// No version record exists; the index was never built.
    InitialBuild,
    /// Schema, engine version or storage epoch changed.
    VersionChanged,
    /// The version record is unreadable or the index was not shut down cleanly.
    CorruptedRebuild,
}

impl VersionDiff {
    /// Returns true if the index must be wiped and rebuilt.
    #[must_use]
    pub fn requires_rebuild(self) -> bool {
        self != Self::UpToDate
    }
}

/// Owns the manifest and every index's version record.
#[derive(Debug)]
pub struct VersionStore {
    dir: Arc<EngineDir>,
    manifest: Mutex<Manifest>,
    clock: Arc<dyn Clock>,
    common_version: u32,
    resolution: i64,
}

impl VersionStore {
    /// Loads the manifest of `dir`, creating it for a fresh root.
    pub fn open(
        dir: Arc<EngineDir>,
        clock: Arc<dyn Clock>,
        common_version: u32,
        resolution: i64,
    ) -> CoreResult<Self> {
        let manifest = match dir.load_manifest()? {
            Some(manifest) => manifest,
            None => {
                let manifest = Manifest::new(FORMAT_VERSION, clock.now_millis());
                dir.save_manifest(&manifest)?;
                debug!(epoch = manifest.storage_epoch, "created engine manifest");
                manifest
            }
        };

        if manifest.format_version.0 != FORMAT_VERSION.0 {
            return Err(CoreError::invalid_format(format!(
                "unsupported engine format {}.{}",
                manifest.format_version.0, manifest.format_version.1
            )));
        }

        Ok(Self {
            dir,
            manifest: Mutex::new(manifest),
            clock,
            common_version,
            resolution: resolution.max(1),
        })
    }

    /// Returns the storage epoch of the root.
    #[must_use]
    pub fn storage_epoch(&self) -> i64 {
        self.manifest.lock().storage_epoch
    }

    /// Returns the engine-wide common version.
    #[must_use]
    pub fn common_version(&self) -> u32 {
        self.common_version
    }

    /// Returns the highest creation stamp ever assigned in this root.
    #[must_use]
    pub fn max_creation_stamp(&self) -> i64 {
        self.manifest.lock().max_creation_stamp
    }

    /// Reads the persisted version of an index.
    pub fn read_version(&self, name: &str) -> CoreResult<Option<IndexVersion>> {
        match read_optional(&self.dir.version_path(name))? {
            Some(data) => Ok(Some(IndexVersion::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Compares the persisted version of `name` with `schema_version`.
    pub fn version_diff(&self, name: &str, schema_version: u32) -> CoreResult<VersionDiff> {
        let persisted = match self.read_version(name) {
            Ok(Some(version)) => version,
            Ok(None) => return Ok(VersionDiff::InitialBuild),
            Err(CoreError::InvalidFormat { .. }) => return Ok(VersionDiff::CorruptedRebuild),
            Err(e) => return Err(e),
        };

        if self.dir.is_marked_dirty(name) {
            return Ok(VersionDiff::CorruptedRebuild);
        }

        let epoch = self.storage_epoch();
        let diff = if persisted.schema_version != schema_version
            || persisted.engine_version != self.common_version
            || persisted.storage_epoch != epoch
        {
            VersionDiff::VersionChanged
        } else {
            VersionDiff::UpToDate
        };
        Ok(diff)
    }

    /// Replaces the version record of `name` with a fresh creation stamp.
    ///
    /// The new stamp is the current time, raised to at least one resolution
    /// unit past both the previous stamp of this index and the highest stamp
    /// the root has recorded. The raised maximum is persisted in the manifest
    /// before the version record, so a crash between the two writes can only
    /// waste a stamp, never reuse one.
    pub fn rewrite_version(&self, name: &str, schema_version: u32) -> CoreResult<IndexVersion> {
        let previous = match self.read_version(name) {
            Ok(version) => version.map_or(0, |v| v.creation_stamp),
            Err(CoreError::InvalidFormat { .. }) => 0,
            Err(e) => return Err(e),
        };

        let mut manifest = self.manifest.lock();
        let floor = previous
            .max(manifest.max_creation_stamp)
            .saturating_add(self.resolution);
        let creation_stamp = self.clock.now_millis().max(floor);

        manifest.get_or_create_index(name);
        manifest.observe_stamp(creation_stamp);
        self.dir.save_manifest(&manifest)?;

        let version = IndexVersion {
            schema_version,
            engine_version: self.common_version,
            storage_epoch: manifest.storage_epoch,
            creation_stamp,
        };
        self.dir.ensure_index_dir(name)?;
        write_atomic(&self.dir.version_path(name), &version.encode())?;

        debug!(index = name, creation_stamp, previous, "rewrote index version");
        Ok(version)
    }
}
