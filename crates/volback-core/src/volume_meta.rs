//! Snapshot of volume-level attributes stored with a backup
//!
//! The snapshot is a JSON object keyed by section name plus a `version`
//! field. Which fields of each section are re-applied on restore depends
//! on that version; see the engine's restore factory.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Base volume attributes (name, description, encryption, type)
pub const BASE_SECTION: &str = "volume-base-metadata";

/// Free-form volume metadata key/values
pub const EXTENDED_SECTION: &str = "volume-metadata";

/// Image metadata inherited from the image service
pub const GLANCE_SECTION: &str = "volume-glance-metadata";

/// Snapshot version written by this engine
pub const VOLUME_META_VERSION: u32 = 2;

/// Versioned volume attribute snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetaSnapshot {
    pub version: u32,
    #[serde(flatten)]
    pub sections: BTreeMap<String, Map<String, Value>>,
}

impl VolumeMetaSnapshot {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            sections: BTreeMap::new(),
        }
    }

    /// Insert a section, replacing any previous one with the same name
    pub fn insert_section(&mut self, name: &str, fields: Map<String, Value>) {
        self.sections.insert(name.to_string(), fields);
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        if value.get("version").and_then(Value::as_u64).is_none() {
            return Err(Error::Metadata(
                "volume metadata snapshot has no numeric version".into(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_wire_shape() {
        let mut snapshot = VolumeMetaSnapshot::new(VOLUME_META_VERSION);
        let base = json!({"display_name": "db", "encryption_key_id": null});
        snapshot.insert_section(BASE_SECTION, base.as_object().unwrap().clone());

        let value: Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value[BASE_SECTION]["display_name"], "db");

        let parsed = VolumeMetaSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_missing_version_rejected() {
        let err = VolumeMetaSnapshot::from_json(r#"{"volume-metadata": {}}"#).unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }
}
