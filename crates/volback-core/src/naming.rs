//! Object naming for a backup's namespace
//!
//! Every object a backup writes lives under one prefix, generated once
//! per backup and stored in the backup's `service_metadata`:
//! - `<prefix>-<seq:05>` chunk objects
//! - `<prefix>_metadata` the metadata object
//! - `<prefix>_sha256file` the sha file

use chrono::{DateTime, Utc};

/// Suffix of the metadata object
pub const METADATA_SUFFIX: &str = "_metadata";

/// Suffix of the sha file
pub const SHA_SUFFIX: &str = "_sha256file";

/// Identity a prefix is generated from
#[derive(Debug, Clone)]
pub struct PrefixSeed {
    pub volume_id: String,
    pub backup_id: String,
    pub availability_zone: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PrefixSeed {
    /// Default prefix: `volume_<vol>/<YYYYmmddHHMMSS>/az_<az>_backup_<id>`
    pub fn default_prefix(&self) -> String {
        format!(
            "volume_{}/{}/az_{}_backup_{}",
            self.volume_id,
            self.created_at.format("%Y%m%d%H%M%S"),
            self.availability_zone.as_deref().unwrap_or("None"),
            self.backup_id
        )
    }
}

/// Names of the objects belonging to one backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNaming {
    prefix: String,
}

impl ObjectNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn metadata_object_name(&self) -> String {
        format!("{}{}", self.prefix, METADATA_SUFFIX)
    }

    pub fn sha_object_name(&self) -> String {
        format!("{}{}", self.prefix, SHA_SUFFIX)
    }

    /// Name of the chunk object with sequence id `seq`
    pub fn chunk_object_name(&self, seq: u64) -> String {
        format!("{}-{:05}", self.prefix, seq)
    }

    /// Sequence id of a chunk object in this namespace
    pub fn chunk_sequence(&self, name: &str) -> Option<u64> {
        let seq = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        seq.parse().ok()
    }

    /// Whether `name` is an object this backup wrote.
    ///
    /// A different backup whose prefix merely starts with this one is not
    /// matched.
    pub fn owns(&self, name: &str) -> bool {
        self.chunk_sequence(name).is_some()
            || name == self.metadata_object_name()
            || name == self.sha_object_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_object_names() {
        let naming = ObjectNaming::new("volume_v1/20240101000000/az_nova_backup_b1");
        assert_eq!(
            naming.metadata_object_name(),
            "volume_v1/20240101000000/az_nova_backup_b1_metadata"
        );
        assert_eq!(
            naming.sha_object_name(),
            "volume_v1/20240101000000/az_nova_backup_b1_sha256file"
        );
        assert_eq!(
            naming.chunk_object_name(7),
            "volume_v1/20240101000000/az_nova_backup_b1-00007"
        );
        assert_eq!(
            naming.chunk_object_name(123456),
            "volume_v1/20240101000000/az_nova_backup_b1-123456"
        );
    }

    #[test]
    fn test_chunk_sequence_parse() {
        let naming = ObjectNaming::new("p");
        assert_eq!(naming.chunk_sequence("p-00042"), Some(42));
        assert_eq!(naming.chunk_sequence("p-"), None);
        assert_eq!(naming.chunk_sequence("p-00x1"), None);
        assert_eq!(naming.chunk_sequence("q-00001"), None);
    }

    #[test]
    fn test_owns_ignores_sibling_prefix() {
        let naming = ObjectNaming::new("vol/backup_1");
        assert!(naming.owns("vol/backup_1-00001"));
        assert!(naming.owns("vol/backup_1_metadata"));
        assert!(naming.owns("vol/backup_1_sha256file"));
        assert!(!naming.owns("vol/backup_12-00001"));
        assert!(!naming.owns("vol/backup_12_metadata"));
        assert!(!naming.owns("vol/backup_1_other"));
    }

    #[test]
    fn test_default_prefix() {
        let seed = PrefixSeed {
            volume_id: "vol-1".into(),
            backup_id: "bk-9".into(),
            availability_zone: Some("zone-a".into()),
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 10, 20, 30).unwrap(),
        };
        assert_eq!(
            seed.default_prefix(),
            "volume_vol-1/20240305102030/az_zone-a_backup_bk-9"
        );
    }
}
