//! Per-key value containers.
//!
//! A [`ValueContainer`] is what the inverted table stores under one key:
//! every distinct value together with the files that produced it. Most
//! values come from a single file, so a value holds one inline id until a
//! second file shows up and only then grows an [`IdSet`].
//!
//! # Wire format
//!
//! ```text
//! varint(value_count)
//! repeat value_count:
//!     varint(len) value_bytes
//!     varint(header)
//!         header & 1 == 1 → single file, id = header >> 1
//!         header & 1 == 0 → count = header >> 1, then count varint deltas
//!                           of the ascending ids (the first from zero)
//! ```

use crate::codec::{write_bytes, write_varint, IndexValue, Reader};
use crate::error::{CoreError, CoreResult};
use crate::types::FileId;
use roaring::RoaringBitmap;

/// A growable set of file ids kept in insertion order.
///
/// The set remembers whether insertions happened in ascending order. When
/// they did, ids are delta-encoded directly; otherwise a bitset pass sorts
/// them at serialization time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ids: Vec<u32>,
    sorted: bool,
}

impl IdSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ids: Vec::new(),
            sorted: true,
        }
    }

    fn from_sorted(ids: Vec<u32>) -> Self {
        Self { ids, sorted: true }
    }

    /// Number of ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the set holds no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns true while every insertion so far was ascending.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    fn position(&self, id: u32) -> Option<usize> {
        if self.sorted {
            self.ids.binary_search(&id).ok()
        } else {
            self.ids.iter().position(|&x| x == id)
        }
    }

    /// Returns true if `id` is present.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.position(id).is_some()
    }

    /// Inserts `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: u32) -> bool {
        if self.contains(id) {
            return false;
        }
        if let Some(&last) = self.ids.last() {
            if id < last {
                self.sorted = false;
            }
        }
        self.ids.push(id);
        true
    }

    /// Removes `id`. Returns false if it was absent.
    pub fn remove(&mut self, id: u32) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Returns the ids in ascending order.
    #[must_use]
    pub fn to_sorted_vec(&self) -> Vec<u32> {
        if self.sorted {
            return self.ids.clone();
        }
        let bitmap: RoaringBitmap = self.ids.iter().copied().collect();
        bitmap.iter().collect()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        write_varint(buf, (self.ids.len() as u64) << 1);
        let mut previous = 0u32;
        for id in self.to_sorted_vec() {
            write_varint(buf, u64::from(id - previous));
            previous = id;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Files {
    One(u32),
    Many(IdSet),
}

impl Files {
    fn contains(&self, id: u32) -> bool {
        match self {
            Self::One(single) => *single == id,
            Self::Many(set) => set.contains(id),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(set) => set.len(),
        }
    }

    fn insert(&mut self, id: u32) -> bool {
        match self {
            Self::One(single) if *single == id => false,
            Self::One(single) => {
                let mut set = IdSet::new();
                set.insert(*single);
                set.insert(id);
                *self = Self::Many(set);
                true
            }
            Self::Many(set) => set.insert(id),
        }
    }

    /// Removes `id`; returns `None` when the last id went away.
    fn remove(self, id: u32) -> (Option<Self>, bool) {
        match self {
            Self::One(single) if single == id => (None, true),
            one @ Self::One(_) => (Some(one), false),
            Self::Many(mut set) => {
                let removed = set.remove(id);
                let rest = match set.len() {
                    0 => None,
                    1 => set.ids.first().map(|&only| Self::One(only)),
                    _ => Some(Self::Many(set)),
                };
                (rest, removed)
            }
        }
    }

    fn sorted(&self) -> Vec<u32> {
        match self {
            Self::One(single) => vec![*single],
            Self::Many(set) => set.to_sorted_vec(),
        }
    }
}

/// Values stored under one key, each with the set of files producing it.
///
/// A file contributes at most one value per key: associating a file with a
/// new value detaches it from the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueContainer<V> {
    entries: Vec<(V, Files)>,
}

impl<V> Default for ValueContainer<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V: IndexValue> ValueContainer<V> {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no file contributes to this key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct values.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of (value, file) associations.
    #[must_use]
    pub fn association_count(&self) -> usize {
        self.entries.iter().map(|(_, files)| files.len()).sum()
    }

    /// Associates `file` with `value`.
    ///
    /// Returns false if the association already existed unchanged.
    pub fn add_value(&mut self, file: FileId, value: V) -> bool {
        let id = file.as_u32();
        if let Some((_, files)) = self.entries.iter().find(|(v, _)| *v == value) {
            if files.contains(id) {
                return false;
            }
        }

        self.remove_associated_value(file);
        match self.entries.iter_mut().find(|(v, _)| *v == value) {
            Some((_, files)) => {
                files.insert(id);
            }
            None => self.entries.push((value, Files::One(id))),
        }
        true
    }

    /// Removes whatever value `file` is associated with.
    ///
    /// Returns false if the file had no association.
    pub fn remove_associated_value(&mut self, file: FileId) -> bool {
        let id = file.as_u32();
        let Some(pos) = self.entries.iter().position(|(_, files)| files.contains(id)) else {
            return false;
        };

        let files = std::mem::replace(&mut self.entries[pos].1, Files::One(id));
        let (rest, removed) = files.remove(id);
        match rest {
            Some(rest) => self.entries[pos].1 = rest,
            None => {
                self.entries.remove(pos);
            }
        }
        removed
    }

    /// Returns true if `file` contributes any value.
    #[must_use]
    pub fn contains_file(&self, file: FileId) -> bool {
        self.value_of(file).is_some()
    }

    /// Returns the value `file` contributes, if any.
    #[must_use]
    pub fn value_of(&self, file: FileId) -> Option<&V> {
        let id = file.as_u32();
        self.entries
            .iter()
            .find(|(_, files)| files.contains(id))
            .map(|(value, _)| value)
    }

    /// Iterates over the distinct values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(value, _)| value)
    }

    /// Iterates over values with their files in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (&V, Vec<FileId>)> {
        self.entries
            .iter()
            .map(|(value, files)| (value, files.sorted().into_iter().map(FileId).collect()))
    }

    /// Returns every contributing file in ascending order.
    #[must_use]
    pub fn files(&self) -> Vec<FileId> {
        let mut all: RoaringBitmap = RoaringBitmap::new();
        for (_, files) in &self.entries {
            match files {
                Files::One(id) => {
                    all.insert(*id);
                }
                Files::Many(set) => all.extend(set.ids.iter().copied()),
            }
        }
        all.iter().map(FileId).collect()
    }

    /// Serializes the container.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        write_varint(&mut buf, self.entries.len() as u64);
        for (value, files) in &self.entries {
            write_bytes(&mut buf, &value.to_bytes()?);
            match files {
                Files::One(id) => write_varint(&mut buf, (u64::from(*id) << 1) | 1),
                Files::Many(set) => set.encode_into(&mut buf),
            }
        }
        Ok(buf)
    }

    /// Deserializes a container written by [`ValueContainer::encode`].
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::new(data);
        let value_count = reader.read_varint("value count")?;
        let mut entries = Vec::with_capacity(value_count.min(1024) as usize);

        for _ in 0..value_count {
            let value = V::from_bytes(reader.read_bytes("value")?)?;
            let header = reader.read_varint("id header")?;
            let files = if header & 1 == 1 {
                Files::One(id_from(header >> 1)?)
            } else {
                let count = header >> 1;
                if count < 2 {
                    return Err(CoreError::invalid_format(format!(
                        "id set with {count} ids must be stored inline"
                    )));
                }
                let mut ids = Vec::with_capacity(count.min(4096) as usize);
                let mut previous = 0u64;
                for i in 0..count {
                    let delta = reader.read_varint("id delta")?;
                    if i > 0 && delta == 0 {
                        return Err(CoreError::invalid_format("id set is not strictly ascending"));
                    }
                    previous += delta;
                    ids.push(id_from(previous)?);
                }
                Files::Many(IdSet::from_sorted(ids))
            };
            entries.push((value, files));
        }

        if !reader.is_empty() {
            return Err(CoreError::invalid_format("trailing bytes after value container"));
        }
        Ok(Self { entries })
    }
}

fn id_from(raw: u64) -> CoreResult<u32> {
    u32::try_from(raw).map_err(|_| CoreError::invalid_format(format!("file id {raw} out of range")))
}
