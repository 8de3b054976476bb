//! Backup and volume records
//!
//! Records are owned by the caller's persistence layer. The engine reads
//! them through the repository traits and writes back status, size and
//! object counts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};

/// Bytes per GiB, the unit of volume sizes
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Backup lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Creating,
    Available,
    Error,
    Restoring,
    Deleting,
    Deleted,
    ErrorDeleting,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Creating => "creating",
            BackupStatus::Available => "available",
            BackupStatus::Error => "error",
            BackupStatus::Restoring => "restoring",
            BackupStatus::Deleting => "deleting",
            BackupStatus::Deleted => "deleted",
            BackupStatus::ErrorDeleting => "error_deleting",
        };
        f.write_str(s)
    }
}

/// Volume status as far as backups are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Available,
    InUse,
    BackingUp,
    RestoringBackup,
    #[serde(rename = "error_restoring")]
    ErrorRestoring,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::BackingUp => "backing-up",
            VolumeStatus::RestoringBackup => "restoring-backup",
            VolumeStatus::ErrorRestoring => "error_restoring",
        };
        f.write_str(s)
    }
}

/// A backup record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub volume_id: String,
    /// Backup this one is incremental to
    pub parent_id: Option<String>,
    /// Object-store container; the configured default when unset
    pub container: Option<String>,
    /// Object-name prefix, generated once on first run
    pub service_metadata: Option<String>,
    pub status: BackupStatus,
    /// Bytes read from the volume stream
    pub size: u64,
    /// Chunk objects this backup wrote itself
    pub object_count: u64,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub availability_zone: Option<String>,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Backup {
    /// New record in `creating` status
    pub fn new(id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            volume_id: volume_id.into(),
            parent_id: None,
            container: None,
            service_metadata: None,
            status: BackupStatus::Creating,
            size: 0,
            object_count: 0,
            display_name: None,
            display_description: None,
            availability_zone: None,
            fail_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Move to `status`, recording the failure reason for error states
    pub fn set_status(&mut self, status: BackupStatus, reason: Option<String>) {
        self.status = status;
        self.fail_reason = reason;
        self.updated_at = Utc::now();
    }
}

/// A volume record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    /// Size in GiB
    pub size: u64,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub encryption_key_id: Option<String>,
    pub volume_type_id: Option<String>,
    pub host: Option<String>,
    pub availability_zone: Option<String>,
    pub status: VolumeStatus,
    /// Free-form key/values
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Image metadata inherited from the image service
    #[serde(default)]
    pub glance_metadata: BTreeMap<String, String>,
    /// Backup this volume was last restored from
    pub restored_from_backup_id: Option<String>,
}

impl Volume {
    pub fn new(id: impl Into<String>, size_gib: u64) -> Self {
        Self {
            id: id.into(),
            size: size_gib,
            display_name: None,
            display_description: None,
            encryption_key_id: None,
            volume_type_id: None,
            host: None,
            availability_zone: None,
            status: VolumeStatus::Available,
            metadata: BTreeMap::new(),
            glance_metadata: BTreeMap::new(),
            restored_from_backup_id: None,
        }
    }

    /// Capacity in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size.saturating_mul(GIB)
    }
}

/// Persistence of backup records
#[async_trait]
pub trait BackupRepository: Send + Sync {
    /// Load a backup; `BackupNotFound` if absent
    async fn get_backup(&self, id: &str) -> EngineResult<Backup>;

    /// Insert or replace a backup
    async fn save_backup(&self, backup: &Backup) -> EngineResult<()>;

    async fn list_backups(&self) -> EngineResult<Vec<Backup>>;

    /// Backups naming `id` as parent that are not deleted
    async fn dependents_of(&self, id: &str) -> EngineResult<Vec<Backup>> {
        Ok(self
            .list_backups()
            .await?
            .into_iter()
            .filter(|b| b.parent_id.as_deref() == Some(id) && b.status != BackupStatus::Deleted)
            .collect())
    }
}

/// Persistence of volume records
#[async_trait]
pub trait VolumeRepository: Send + Sync {
    /// Load a volume; `VolumeNotFound` if absent
    async fn get_volume(&self, id: &str) -> EngineResult<Volume>;

    /// Insert or replace a volume
    async fn save_volume(&self, volume: &Volume) -> EngineResult<()>;

    async fn list_volumes(&self) -> EngineResult<Vec<Volume>>;
}

/// Process-local repository for both record kinds
#[derive(Default)]
pub struct InMemoryRepository {
    backups: RwLock<HashMap<String, Backup>>,
    volumes: RwLock<HashMap<String, Volume>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupRepository for InMemoryRepository {
    async fn get_backup(&self, id: &str) -> EngineResult<Backup> {
        self.backups
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::BackupNotFound(id.to_string()))
    }

    async fn save_backup(&self, backup: &Backup) -> EngineResult<()> {
        self.backups
            .write()
            .await
            .insert(backup.id.clone(), backup.clone());
        Ok(())
    }

    async fn list_backups(&self) -> EngineResult<Vec<Backup>> {
        let mut backups: Vec<Backup> = self.backups.read().await.values().cloned().collect();
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(backups)
    }
}

#[async_trait]
impl VolumeRepository for InMemoryRepository {
    async fn get_volume(&self, id: &str) -> EngineResult<Volume> {
        self.volumes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::VolumeNotFound(id.to_string()))
    }

    async fn save_volume(&self, volume: &Volume) -> EngineResult<()> {
        self.volumes
            .write()
            .await
            .insert(volume.id.clone(), volume.clone());
        Ok(())
    }

    async fn list_volumes(&self) -> EngineResult<Vec<Volume>> {
        let mut volumes: Vec<Volume> = self.volumes.read().await.values().cloned().collect();
        volumes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&BackupStatus::ErrorDeleting).unwrap(),
            r#""error_deleting""#
        );
        assert_eq!(
            serde_json::to_string(&VolumeStatus::RestoringBackup).unwrap(),
            r#""restoring-backup""#
        );
        assert_eq!(
            serde_json::to_string(&VolumeStatus::ErrorRestoring).unwrap(),
            r#""error_restoring""#
        );
        assert_eq!(VolumeStatus::ErrorRestoring.to_string(), "error_restoring");
    }

    #[tokio::test]
    async fn test_in_memory_repository() {
        let repo = InMemoryRepository::new();
        let parent = Backup::new("b1", "v1");
        let child = Backup::new("b2", "v1").with_parent("b1");
        repo.save_backup(&parent).await.unwrap();
        repo.save_backup(&child).await.unwrap();

        assert_eq!(repo.get_backup("b1").await.unwrap(), parent);
        assert!(matches!(
            repo.get_backup("nope").await.unwrap_err(),
            EngineError::BackupNotFound(_)
        ));

        let dependents = repo.dependents_of("b1").await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, "b2");

        let mut child = child;
        child.set_status(BackupStatus::Deleted, None);
        repo.save_backup(&child).await.unwrap();
        assert!(repo.dependents_of("b1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_volume_records() {
        let repo = InMemoryRepository::new();
        let volume = Volume::new("v1", 2);
        assert_eq!(volume.size_bytes(), 2 * GIB);
        repo.save_volume(&volume).await.unwrap();
        assert_eq!(repo.get_volume("v1").await.unwrap(), volume);
        assert!(matches!(
            repo.get_volume("v2").await.unwrap_err(),
            EngineError::VolumeNotFound(_)
        ));
    }
}
