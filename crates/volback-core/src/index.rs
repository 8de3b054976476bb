//! Object and sha indexes built while a backup runs
//!
//! The object index maps every chunk object to the logical range of the
//! volume stream it holds. The sha index holds one SHA-256 per integrity
//! block of the volume stream, in stream order.

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::digest::IntegrityDigest;

/// Location and checksum of one stored chunk object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// MD5 (hex) of the stored, compressed bytes
    pub md5: String,
    /// Offset of the chunk in the volume stream
    pub offset: u64,
    /// Number of volume bytes the chunk covers
    pub length: u64,
    /// Compression applied to the stored bytes (`None` when uncompressed)
    #[serde(default)]
    pub compression: Option<String>,
}

impl ObjectRecord {
    /// End offset (exclusive) of the covered range
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// One entry of the object list.
///
/// On the wire an entry is a single-key map `{ "<name>": { ...record } }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    pub record: ObjectRecord,
}

impl Serialize for ObjectEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.record)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ObjectEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = ObjectEntry;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a single-entry map of object name to record")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ObjectEntry, A::Error> {
                let (name, record) = map
                    .next_entry::<String, ObjectRecord>()?
                    .ok_or_else(|| de::Error::custom("empty object entry"))?;
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("object entry has more than one name"));
                }
                Ok(ObjectEntry { name, record })
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

/// Index of chunk objects for one backup (`object_meta`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIndex {
    /// Next sequence id to hand out
    pub id: u64,
    /// Chunk objects in the order they were read
    pub list: Vec<ObjectEntry>,
    /// Object-name prefix of the owning backup
    pub prefix: String,
    /// Serialized volume attributes captured at backup time
    pub volume_meta: Option<String>,
    /// Opaque string supplied by the object store
    pub extra_metadata: Option<String>,
}

impl ObjectIndex {
    /// Fresh index for a full backup
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            id: 1,
            list: Vec::new(),
            prefix: prefix.into(),
            volume_meta: None,
            extra_metadata: None,
        }
    }

    /// Index for an incremental backup, seeded with the parent's live
    /// objects. New ids continue past every sequence the parent lists.
    pub fn inherit(prefix: impl Into<String>, parent_objects: &[ObjectEntry]) -> Self {
        let highest = parent_objects
            .iter()
            .filter_map(|entry| trailing_sequence(&entry.name))
            .max()
            .unwrap_or(0)
            .max(parent_objects.len() as u64);
        Self {
            id: highest + 1,
            list: live_entries(parent_objects).into_iter().cloned().collect(),
            prefix: prefix.into(),
            volume_meta: None,
            extra_metadata: None,
        }
    }

    /// Allocate the next sequence id
    pub fn allocate(&mut self) -> u64 {
        let id = self.id;
        self.id += 1;
        id
    }

    /// Append a chunk object
    pub fn push(&mut self, name: String, record: ObjectRecord) {
        self.list.push(ObjectEntry { name, record });
    }

    /// Drop entries starting at or past `logical_size`.
    ///
    /// Returns how many entries were removed.
    pub fn truncate_to(&mut self, logical_size: u64) -> usize {
        let before = self.list.len();
        self.list.retain(|entry| entry.record.offset < logical_size);
        before - self.list.len()
    }

    /// Entries still visible after later entries replaced earlier ones
    /// at the same offset, in list order.
    pub fn live_entries(&self) -> Vec<&ObjectEntry> {
        live_entries(&self.list)
    }

    /// Drop entries replaced by a later entry at the same offset.
    ///
    /// Returns how many entries were removed.
    pub fn compact(&mut self) -> usize {
        let before = self.list.len();
        self.list = live_entries(&self.list).into_iter().cloned().collect();
        before - self.list.len()
    }
}

/// Sequence id at the end of a chunk object name (`...-00042`)
fn trailing_sequence(name: &str) -> Option<u64> {
    let (_, seq) = name.rsplit_once('-')?;
    if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    seq.parse().ok()
}

/// Keep the last entry per offset, preserving list order
pub fn live_entries(list: &[ObjectEntry]) -> Vec<&ObjectEntry> {
    let mut last_at: HashMap<u64, usize> = HashMap::with_capacity(list.len());
    for (i, entry) in list.iter().enumerate() {
        last_at.insert(entry.record.offset, i);
    }
    list.iter()
        .enumerate()
        .filter(|(i, entry)| last_at.get(&entry.record.offset) == Some(i))
        .map(|(_, entry)| entry)
        .collect()
}

/// Integrity digests for one backup (`object_sha256`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaIndex {
    /// Next integrity-block sequence
    pub id: u64,
    /// One digest per integrity block, in stream order
    pub sha256s: Vec<IntegrityDigest>,
    /// Object-name prefix of the owning backup
    pub prefix: String,
}

impl ShaIndex {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            id: 1,
            sha256s: Vec::new(),
            prefix: prefix.into(),
        }
    }

    /// Append the digests of one chunk
    pub fn extend(&mut self, digests: &[IntegrityDigest]) {
        self.sha256s.extend_from_slice(digests);
        self.id += digests.len() as u64;
    }

    pub fn block_count(&self) -> usize {
        self.sha256s.len()
    }
}
