//! Table record envelope.
//!
//! ```text
//! magic (4) | version (2) | op (1) | key_len (4) | value_len (4) | key | value | crc32 (4)
//! ```
//!
//! The CRC covers everything before it.

use crate::codec::{crc32, Reader};
use crate::error::{CoreError, CoreResult};

/// Magic bytes identifying a table record.
pub(crate) const RECORD_MAGIC: [u8; 4] = *b"IXTR";

/// Current record format version.
pub(crate) const RECORD_VERSION: u16 = 1;

/// Size of the fixed header.
pub(crate) const HEADER_SIZE: usize = 15;

/// Size of the trailing checksum.
pub(crate) const CRC_SIZE: usize = 4;

/// Kind of table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordOp {
    /// Associates a value with a key.
    Put = 1,
    /// Removes a key.
    Remove = 2,
}

impl RecordOp {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Remove),
            _ => None,
        }
    }
}

/// A decoded table record borrowing from the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableRecord<'a> {
    pub op: RecordOp,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Outcome of scanning one record out of a buffer.
#[derive(Debug)]
pub(crate) enum Scan<'a> {
    /// A complete, checksummed record and its total encoded length.
    Record(TableRecord<'a>, usize),
    /// The buffer ends inside this record.
    Incomplete,
}

impl<'a> TableRecord<'a> {
    /// Encodes a record into a fresh buffer.
    pub(crate) fn encode(op: RecordOp, key: &[u8], value: &[u8]) -> CoreResult<Vec<u8>> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| CoreError::invalid_format("table key too large"))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| CoreError::invalid_format("table value too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + key.len() + value.len() + CRC_SIZE);
        data.extend_from_slice(&RECORD_MAGIC);
        data.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        data.push(op as u8);
        data.extend_from_slice(&key_len.to_le_bytes());
        data.extend_from_slice(&value_len.to_le_bytes());
        data.extend_from_slice(key);
        data.extend_from_slice(value);

        let crc = crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Scans the record at the start of `data`.
    ///
    /// Returns [`Scan::Incomplete`] when `data` is shorter than the record it
    /// starts, and an error when the bytes present are not a valid record.
    pub(crate) fn scan(data: &'a [u8]) -> CoreResult<Scan<'a>> {
        if data.len() < HEADER_SIZE {
            return Ok(Scan::Incomplete);
        }

        let mut reader = Reader::new(data);
        let magic = reader.take(4, "record magic")?;
        if magic != RECORD_MAGIC {
            return Err(CoreError::invalid_format("invalid table record magic"));
        }
        let version = reader.read_u16("record version")?;
        if version > RECORD_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported table record version: {version}"
            )));
        }
        let op_byte = reader.read_u8("record op")?;
        let op = RecordOp::from_byte(op_byte).ok_or_else(|| {
            CoreError::invalid_format(format!("unknown table record op: {op_byte}"))
        })?;
        let key_len = reader.read_u32("key length")? as usize;
        let value_len = reader.read_u32("value length")? as usize;

        let total = HEADER_SIZE
            .checked_add(key_len)
            .and_then(|n| n.checked_add(value_len))
            .and_then(|n| n.checked_add(CRC_SIZE))
            .ok_or_else(|| CoreError::invalid_format("table record length overflow"))?;
        if data.len() < total {
            return Ok(Scan::Incomplete);
        }

        let key = reader.take(key_len, "record key")?;
        let value = reader.take(value_len, "record value")?;
        let body_end = reader.position();
        let stored_crc = reader.read_u32("record crc")?;
        let computed_crc = crc32(&data[..body_end]);
        if stored_crc != computed_crc {
            return Err(CoreError::invalid_format(format!(
                "table record checksum mismatch: expected {stored_crc:08x}, got {computed_crc:08x}"
            )));
        }

        Ok(Scan::Record(TableRecord { op, key, value }, total))
    }

    /// Decodes a record that must occupy exactly `data`.
    pub(crate) fn decode_exact(data: &'a [u8]) -> CoreResult<Self> {
        match Self::scan(data)? {
            Scan::Record(record, len) if len == data.len() => Ok(record),
            Scan::Record(..) => Err(CoreError::invalid_format("trailing bytes after table record")),
            Scan::Incomplete => Err(CoreError::invalid_format("truncated table record")),
        }
    }
}
