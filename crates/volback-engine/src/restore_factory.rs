//! Restore factories for saved volume attributes
//!
//! A backup stores a versioned snapshot of its volume's attributes. On
//! restore the snapshot's version selects a factory: a table from section
//! name to an apply function and the fields that function may touch.
//!
//! | version | base section fields | other sections |
//! |---|---|---|
//! | 1 | display name, description | all keys |
//! | 2 | + encryption key (volume-type checked) | all keys |

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;
use volback_core::{
    VolumeMetaSnapshot, BASE_SECTION, EXTENDED_SECTION, GLANCE_SECTION, VOLUME_META_VERSION,
};

use crate::error::{EngineError, EngineResult};
use crate::records::Volume;

/// Applies one section to the destination volume.
///
/// Receives the allow-listed fields and the raw section.
type ApplyFn = fn(&mut Volume, &Map<String, Value>, &Map<String, Value>) -> EngineResult<()>;

/// Fields of a section an apply function receives
#[derive(Debug, Clone, Copy)]
pub enum FieldSet {
    All,
    Only(&'static [&'static str]),
}

impl FieldSet {
    fn filter(&self, fields: &Map<String, Value>) -> Map<String, Value> {
        match self {
            FieldSet::All => fields.clone(),
            FieldSet::Only(allowed) => fields
                .iter()
                .filter(|(key, _)| allowed.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

struct SectionRule {
    apply: ApplyFn,
    fields: FieldSet,
}

const BASE_FIELDS_V1: &[&str] = &["display_name", "display_description"];
const BASE_FIELDS_V2: &[&str] = &["display_name", "display_description", "encryption_key_id"];

/// Versioned table of section rules
pub struct RestoreFactory {
    version: u32,
    sections: BTreeMap<&'static str, SectionRule>,
}

impl RestoreFactory {
    /// Factory for a snapshot version
    pub fn for_version(version: u32) -> EngineResult<Self> {
        let base = match version {
            1 => SectionRule {
                apply: apply_base_v1,
                fields: FieldSet::Only(BASE_FIELDS_V1),
            },
            2 => SectionRule {
                apply: apply_base_v2,
                fields: FieldSet::Only(BASE_FIELDS_V2),
            },
            other => {
                return Err(EngineError::SchemaVersionUnsupported(format!(
                    "volume metadata version {}",
                    other
                )))
            }
        };

        let mut sections = BTreeMap::new();
        sections.insert(BASE_SECTION, base);
        sections.insert(
            EXTENDED_SECTION,
            SectionRule {
                apply: apply_extended,
                fields: FieldSet::All,
            },
        );
        sections.insert(
            GLANCE_SECTION,
            SectionRule {
                apply: apply_glance,
                fields: FieldSet::All,
            },
        );

        Ok(Self { version, sections })
    }

    /// Apply every known section of `snapshot` to `volume`
    pub fn apply(&self, snapshot: &VolumeMetaSnapshot, volume: &mut Volume) -> EngineResult<()> {
        for (name, fields) in &snapshot.sections {
            match self.sections.get(name.as_str()) {
                Some(rule) => {
                    let allowed = rule.fields.filter(fields);
                    (rule.apply)(volume, &allowed, fields)?;
                }
                None => debug!(
                    section = %name,
                    version = self.version,
                    "Ignoring unknown volume metadata section"
                ),
            }
        }
        Ok(())
    }
}

/// Re-apply a stored `volume_meta` blob to `volume`
pub fn restore_volume_meta(blob: &str, volume: &mut Volume) -> EngineResult<()> {
    let snapshot = VolumeMetaSnapshot::from_json(blob)?;
    RestoreFactory::for_version(snapshot.version)?.apply(&snapshot, volume)
}

/// Snapshot a volume's attributes at backup time
pub fn capture_volume_meta(volume: &Volume) -> VolumeMetaSnapshot {
    let mut snapshot = VolumeMetaSnapshot::new(VOLUME_META_VERSION);

    let mut base = Map::new();
    base.insert("id".into(), Value::from(volume.id.clone()));
    base.insert("size".into(), Value::from(volume.size));
    base.insert("display_name".into(), optional(&volume.display_name));
    base.insert(
        "display_description".into(),
        optional(&volume.display_description),
    );
    base.insert("encryption_key_id".into(), optional(&volume.encryption_key_id));
    base.insert("volume_type_id".into(), optional(&volume.volume_type_id));
    base.insert("host".into(), optional(&volume.host));
    snapshot.insert_section(BASE_SECTION, base);

    snapshot.insert_section(EXTENDED_SECTION, string_map(&volume.metadata));
    snapshot.insert_section(GLANCE_SECTION, string_map(&volume.glance_metadata));
    snapshot
}

fn optional(value: &Option<String>) -> Value {
    value.clone().map(Value::from).unwrap_or(Value::Null)
}

fn string_map(map: &BTreeMap<String, String>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), Value::from(v.clone())))
        .collect()
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn apply_base_v1(
    volume: &mut Volume,
    fields: &Map<String, Value>,
    _raw: &Map<String, Value>,
) -> EngineResult<()> {
    if let Some(name) = fields.get("display_name") {
        volume.display_name = as_text(name);
    }
    if let Some(description) = fields.get("display_description") {
        volume.display_description = as_text(description);
    }
    Ok(())
}

fn apply_base_v2(
    volume: &mut Volume,
    fields: &Map<String, Value>,
    raw: &Map<String, Value>,
) -> EngineResult<()> {
    apply_base_v1(volume, fields, raw)?;

    let Some(key) = fields.get("encryption_key_id").and_then(as_text) else {
        return Ok(());
    };

    // An encryption key is only valid for the volume type it was made for
    let original_type = raw.get("volume_type_id").and_then(as_text);
    match (original_type, volume.volume_type_id.clone()) {
        (original, destination) if original == destination => {}
        (Some(original), None) => {
            debug!(volume_type_id = %original, "Adopting backup's volume type");
            volume.volume_type_id = Some(original);
        }
        (original, destination) => {
            return Err(EngineError::EncryptedBackupOperationFailed(format!(
                "encrypted backup of volume type {:?} cannot be restored to volume type {:?}",
                original, destination
            )))
        }
    }
    volume.encryption_key_id = Some(key);
    Ok(())
}

fn apply_extended(
    volume: &mut Volume,
    fields: &Map<String, Value>,
    _raw: &Map<String, Value>,
) -> EngineResult<()> {
    for (key, value) in fields {
        if let Some(value) = as_text(value) {
            volume.metadata.insert(key.clone(), value);
        }
    }
    Ok(())
}

fn apply_glance(
    volume: &mut Volume,
    fields: &Map<String, Value>,
    _raw: &Map<String, Value>,
) -> EngineResult<()> {
    for (key, value) in fields {
        if let Some(value) = as_text(value) {
            volume.glance_metadata.insert(key.clone(), value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source_volume() -> Volume {
        let mut volume = Volume::new("src", 1);
        volume.display_name = Some("db".into());
        volume.display_description = Some("primary".into());
        volume.encryption_key_id = Some("key-1".into());
        volume.volume_type_id = Some("luks".into());
        volume.host = Some("node-a".into());
        volume.metadata.insert("tier".into(), "gold".into());
        volume.glance_metadata.insert("image_id".into(), "img-1".into());
        volume
    }

    #[test]
    fn test_capture_then_restore_v2() {
        let blob = capture_volume_meta(&source_volume()).to_json().unwrap();

        let mut dest = Volume::new("dst", 1);
        dest.volume_type_id = Some("luks".into());
        dest.host = Some("node-b".into());
        restore_volume_meta(&blob, &mut dest).unwrap();

        assert_eq!(dest.display_name.as_deref(), Some("db"));
        assert_eq!(dest.display_description.as_deref(), Some("primary"));
        assert_eq!(dest.encryption_key_id.as_deref(), Some("key-1"));
        assert_eq!(dest.metadata.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(
            dest.glance_metadata.get("image_id").map(String::as_str),
            Some("img-1")
        );
        // Not in the allow-list
        assert_eq!(dest.host.as_deref(), Some("node-b"));
        assert_eq!(dest.id, "dst");
    }

    #[test]
    fn test_encrypted_restore_adopts_missing_type() {
        let blob = capture_volume_meta(&source_volume()).to_json().unwrap();
        let mut dest = Volume::new("dst", 1);
        restore_volume_meta(&blob, &mut dest).unwrap();
        assert_eq!(dest.volume_type_id.as_deref(), Some("luks"));
        assert_eq!(dest.encryption_key_id.as_deref(), Some("key-1"));
    }

    #[test]
    fn test_encrypted_restore_rejects_other_type() {
        let blob = capture_volume_meta(&source_volume()).to_json().unwrap();
        let mut dest = Volume::new("dst", 1);
        dest.volume_type_id = Some("plain".into());

        let err = restore_volume_meta(&blob, &mut dest).unwrap_err();
        assert!(matches!(err, EngineError::EncryptedBackupOperationFailed(_)));
        assert!(dest.encryption_key_id.is_none());
    }

    #[test]
    fn test_unencrypted_backup_ignores_type() {
        let mut source = source_volume();
        source.encryption_key_id = None;
        let blob = capture_volume_meta(&source).to_json().unwrap();

        let mut dest = Volume::new("dst", 1);
        dest.volume_type_id = Some("plain".into());
        restore_volume_meta(&blob, &mut dest).unwrap();
        assert_eq!(dest.volume_type_id.as_deref(), Some("plain"));
        assert!(dest.encryption_key_id.is_none());
    }

    #[test]
    fn test_v1_never_restores_encryption_key() {
        let blob = json!({
            "version": 1,
            "volume-base-metadata": {
                "display_name": "old",
                "encryption_key_id": "key-9",
                "volume_type_id": "luks"
            }
        })
        .to_string();

        let mut dest = Volume::new("dst", 1);
        restore_volume_meta(&blob, &mut dest).unwrap();
        assert_eq!(dest.display_name.as_deref(), Some("old"));
        assert!(dest.encryption_key_id.is_none());
        assert!(dest.volume_type_id.is_none());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let blob = json!({"version": 7}).to_string();
        let mut dest = Volume::new("dst", 1);
        let err = restore_volume_meta(&blob, &mut dest).unwrap_err();
        assert!(matches!(err, EngineError::SchemaVersionUnsupported(_)));
    }
}
