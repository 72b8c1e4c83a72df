//! Engine manifest.
//!
//! The manifest holds engine-wide metadata that must survive restarts: the
//! on-disk format version, the storage epoch, the highest creation stamp
//! ever handed out, and the registry of index names.

use crate::codec::{crc32, write_bytes, write_varint, Reader};
use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"IXMF";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

/// Engine manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Format version (major, minor).
    pub format_version: (u16, u16),
    /// Milliseconds since the Unix epoch when this root was created.
    pub storage_epoch: i64,
    /// Highest creation stamp ever assigned to any index of this root.
    pub max_creation_stamp: i64,
    /// Index name to ordinal mapping.
    pub indices: BTreeMap<String, u32>,
    /// Next index ordinal to assign.
    pub next_index_ordinal: u32,
}

impl Manifest {
    /// Creates an empty manifest for a root created at `storage_epoch`.
    #[must_use]
    pub fn new(format_version: (u16, u16), storage_epoch: i64) -> Self {
        Self {
            format_version,
            storage_epoch,
            max_creation_stamp: 0,
            indices: BTreeMap::new(),
            next_index_ordinal: 1,
        }
    }

    /// Gets or assigns the ordinal of an index name.
    pub fn get_or_create_index(&mut self, name: &str) -> u32 {
        if let Some(&ordinal) = self.indices.get(name) {
            return ordinal;
        }

        let ordinal = self.next_index_ordinal;
        self.next_index_ordinal += 1;
        self.indices.insert(name.to_string(), ordinal);
        ordinal
    }

    /// Gets the ordinal of an index name.
    #[must_use]
    pub fn get_index(&self, name: &str) -> Option<u32> {
        self.indices.get(name).copied()
    }

    /// Raises the recorded maximum creation stamp. Returns true if it changed.
    pub fn observe_stamp(&mut self, stamp: i64) -> bool {
        if stamp > self.max_creation_stamp {
            self.max_creation_stamp = stamp;
            true
        } else {
            false
        }
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.format_version.0.to_le_bytes());
        buf.extend_from_slice(&self.format_version.1.to_le_bytes());
        buf.extend_from_slice(&self.storage_epoch.to_le_bytes());
        buf.extend_from_slice(&self.max_creation_stamp.to_le_bytes());
        buf.extend_from_slice(&self.next_index_ordinal.to_le_bytes());

        write_varint(&mut buf, self.indices.len() as u64);
        for (name, &ordinal) in &self.indices {
            write_bytes(&mut buf, name.as_bytes());
            buf.extend_from_slice(&ordinal.to_le_bytes());
        }

        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a manifest from bytes.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        if data.len() < 10 {
            return Err(CoreError::invalid_format("manifest too short"));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32(body) != stored_crc {
            return Err(CoreError::invalid_format("manifest checksum mismatch"));
        }

        let mut reader = Reader::new(&body[4..]);
        let version = reader.read_u16("manifest version")?;
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }
        let format_major = reader.read_u16("format version")?;
        let format_minor = reader.read_u16("format version")?;
        let storage_epoch = reader.read_i64("storage epoch")?;
        let max_creation_stamp = reader.read_i64("max creation stamp")?;
        let next_index_ordinal = reader.read_u32("next index ordinal")?;

        let count = reader.read_varint("index count")?;
        let mut indices = BTreeMap::new();
        for _ in 0..count {
            let name = std::str::from_utf8(reader.read_bytes("index name")?)
                .map_err(|_| CoreError::invalid_format("invalid index name"))?
                .to_string();
            let ordinal = reader.read_u32("index ordinal")?;
            indices.insert(name, ordinal);
        }

        if !reader.is_empty() {
            return Err(CoreError::invalid_format("trailing bytes in manifest"));
        }

        Ok(Self {
            format_version: (format_major, format_minor),
            storage_epoch,
            max_creation_stamp,
            indices,
            next_index_ordinal,
        })
    }
}
