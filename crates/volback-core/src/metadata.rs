//! Backup metadata documents
//!
//! Two JSON documents are written once a backup has uploaded all of its
//! chunk objects:
//! - the metadata object, listing every chunk object the backup needs
//! - the sha file, listing the integrity digests of the volume stream
//!
//! Both carry a schema `version`; readers dispatch on it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::digest::IntegrityDigest;
use crate::error::{Error, Result};
use crate::index::{ObjectEntry, ObjectIndex, ShaIndex};

/// Schema version written by this engine
pub const METADATA_VERSION: &str = "1.0.0";

/// Known metadata schema versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataVersion {
    V1,
}

impl MetadataVersion {
    /// Parse a document's `version` field
    pub fn parse(version: &str) -> Result<Self> {
        match version {
            "1.0.0" => Ok(MetadataVersion::V1),
            other => Err(Error::UnsupportedVersion(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataVersion::V1 => "1.0.0",
        }
    }
}

impl fmt::Display for MetadataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity fields shared by both documents
#[derive(Debug, Clone, Default)]
pub struct DocumentHeader {
    pub backup_id: String,
    pub volume_id: String,
    pub backup_name: Option<String>,
    pub backup_description: Option<String>,
}

/// The `<prefix>_metadata` object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub version: String,
    pub backup_id: String,
    pub volume_id: String,
    pub backup_name: Option<String>,
    pub backup_description: Option<String>,
    /// Size of the chunks the objects were cut into
    #[serde(default)]
    pub chunk_size: u64,
    /// Every chunk object needed to rebuild the volume, own and inherited
    pub objects: Vec<ObjectEntry>,
    pub parent_id: Option<String>,
    pub volume_meta: Option<String>,
    pub extra_metadata: Option<String>,
}

impl MetadataDocument {
    /// Build the document from a finished object index
    pub fn from_index(
        header: &DocumentHeader,
        parent_id: Option<String>,
        chunk_size: u64,
        index: &ObjectIndex,
    ) -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            backup_id: header.backup_id.clone(),
            volume_id: header.volume_id.clone(),
            backup_name: header.backup_name.clone(),
            backup_description: header.backup_description.clone(),
            chunk_size,
            objects: index.list.clone(),
            parent_id,
            volume_meta: index.volume_meta.clone(),
            extra_metadata: index.extra_metadata.clone(),
        }
    }

    /// Schema version of this document
    pub fn schema_version(&self) -> Result<MetadataVersion> {
        MetadataVersion::parse(&self.version)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON
    pub fn from_json(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }
}

/// The `<prefix>_sha256file` object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaFile {
    pub version: String,
    pub backup_id: String,
    pub volume_id: String,
    pub backup_name: Option<String>,
    pub backup_description: Option<String>,
    /// Size of the integrity blocks the digests cover
    pub chunk_size: u64,
    pub sha256s: Vec<IntegrityDigest>,
}

impl ShaFile {
    /// Build the sha file from a finished sha index
    pub fn from_index(header: &DocumentHeader, block_size: u64, index: &ShaIndex) -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            backup_id: header.backup_id.clone(),
            volume_id: header.volume_id.clone(),
            backup_name: header.backup_name.clone(),
            backup_description: header.backup_description.clone(),
            chunk_size: block_size,
            sha256s: index.sha256s.clone(),
        }
    }

    pub fn schema_version(&self) -> Result<MetadataVersion> {
        MetadataVersion::parse(&self.version)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }
}
