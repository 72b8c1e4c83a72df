//! Key and value codecs plus the low-level byte helpers shared by every
//! on-disk format in this crate.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// A key that can be stored in an index.
///
/// Keys must be:
/// - Hashable (cache and forward-set lookups)
/// - Orderable (range scans return keys in order)
/// - Serializable to bytes (persistence)
pub trait IndexKey: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static {
    /// Serializes the key to bytes.
    fn to_bytes(&self) -> CoreResult<Vec<u8>>;

    /// Deserializes the key from bytes.
    fn from_bytes(bytes: &[u8]) -> CoreResult<Self>;
}

/// A value associated with a (key, file) pair.
///
/// Values are grouped inside a [`crate::ValueContainer`], which needs them
/// hashable; they carry no ordering requirement.
pub trait IndexValue: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Serializes the value to bytes.
    fn to_bytes(&self) -> CoreResult<Vec<u8>>;

    /// Deserializes the value from bytes.
    fn from_bytes(bytes: &[u8]) -> CoreResult<Self>;
}

macro_rules! impl_fixed_width {
    ($($ty:ty),*) => {$(
        impl IndexKey for $ty {
            fn to_bytes(&self) -> CoreResult<Vec<u8>> {
                Ok(self.to_be_bytes().to_vec())
            }

            fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
                let arr = bytes.try_into().map_err(|_| {
                    CoreError::invalid_format(format!(
                        "expected {} bytes for {}",
                        std::mem::size_of::<$ty>(),
                        stringify!($ty)
                    ))
                })?;
                Ok(<$ty>::from_be_bytes(arr))
            }
        }

        impl IndexValue for $ty {
            fn to_bytes(&self) -> CoreResult<Vec<u8>> {
                <$ty as IndexKey>::to_bytes(self)
            }

            fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
                <$ty as IndexKey>::from_bytes(bytes)
            }
        }
    )*};
}

impl_fixed_width!(u32, u64, i64);

impl IndexKey for String {
    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|_| CoreError::invalid_format("invalid UTF-8"))
    }
}

impl IndexValue for String {
    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        <String as IndexKey>::to_bytes(self)
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        <String as IndexKey>::from_bytes(bytes)
    }
}

impl IndexKey for Vec<u8> {
    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(self.clone())
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(bytes.to_vec())
    }
}

impl IndexValue for Vec<u8> {
    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(self.clone())
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(bytes.to_vec())
    }
}

impl IndexValue for () {
    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.is_empty() {
            Ok(())
        } else {
            Err(CoreError::invalid_format("expected empty unit value"))
        }
    }
}

/// Stores any serde type as canonical CBOR.
///
/// ```rust
/// use incridx_core::{Cbor, IndexValue};
///
/// let value = Cbor((3u32, "fn main".to_string()));
/// let bytes = IndexValue::to_bytes(&value).unwrap();
/// assert_eq!(<Cbor<(u32, String)> as IndexValue>::from_bytes(&bytes).unwrap(), value);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cbor<T>(pub T);

fn cbor_encode<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| CoreError::invalid_format(format!("CBOR encode failed: {e}")))?;
    Ok(buf)
}

fn cbor_decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| CoreError::invalid_format(format!("CBOR decode failed: {e}")))
}

impl<T> IndexKey for Cbor<T>
where
    T: Serialize + DeserializeOwned + Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static,
{
    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        cbor_encode(&self.0)
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        cbor_decode(bytes).map(Cbor)
    }
}

impl<T> IndexValue for Cbor<T>
where
    T: Serialize + DeserializeOwned + Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        cbor_encode(&self.0)
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        cbor_decode(bytes).map(Cbor)
    }
}

/// Appends `value` as an unsigned LEB128 varint.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        if value < 0x80 {
            buf.push(value as u8);
            break;
        }
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
}

/// Appends a length-prefixed byte string.
pub(crate) fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Bounds-checked cursor over an encoded buffer.
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, len: usize, what: &str) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CoreError::invalid_format(format!("truncated {what}")))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self, what: &str) -> CoreResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn read_u16(&mut self, what: &str) -> CoreResult<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self, what: &str) -> CoreResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64(&mut self, what: &str) -> CoreResult<u64> {
        let b = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub(crate) fn read_i64(&mut self, what: &str) -> CoreResult<i64> {
        self.read_u64(what).map(|v| v as i64)
    }

    pub(crate) fn read_varint(&mut self, what: &str) -> CoreResult<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(CoreError::invalid_format(format!("varint overflow in {what}")));
            }
            let byte = self.read_u8(what)?;
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub(crate) fn read_bytes(&mut self, what: &str) -> CoreResult<&'a [u8]> {
        let len = usize::try_from(self.read_varint(what)?)
            .map_err(|_| CoreError::invalid_format(format!("oversized {what}")))?;
        self.take(len, what)
    }
}

/// Computes the IEEE CRC32 of `data`.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
