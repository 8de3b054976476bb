//! JSON-file record persistence
//!
//! Keeps backup and volume records in a state directory:
//! - backups.json
//! - volumes.json

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::records::{Backup, BackupRepository, Volume, VolumeRepository};

/// On-disk format version of the record files
const STATE_VERSION: u32 = 1;

/// Data format for backups file
#[derive(Debug, Serialize, Deserialize)]
struct BackupsData {
    version: u32,
    backups: Vec<Backup>,
}

/// Data format for volumes file
#[derive(Debug, Serialize, Deserialize)]
struct VolumesData {
    version: u32,
    volumes: Vec<Volume>,
}

/// Repository writing records to JSON files
pub struct JsonFileRepository {
    state_dir: PathBuf,
    /// Serialises read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonFileRepository {
    /// Open (and create) a state directory
    pub async fn new(state_dir: impl AsRef<Path>) -> EngineResult<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&state_dir).await?;

        info!("Record state at {:?}", state_dir);
        Ok(Self {
            state_dir,
            lock: Mutex::new(()),
        })
    }

    fn backups_file(&self) -> PathBuf {
        self.state_dir.join("backups.json")
    }

    fn volumes_file(&self) -> PathBuf {
        self.state_dir.join("volumes.json")
    }

    async fn load_backups(&self) -> EngineResult<Vec<Backup>> {
        Ok(load_file::<BackupsData>(&self.backups_file())
            .await?
            .map(|data| data.backups)
            .unwrap_or_default())
    }

    async fn load_volumes(&self) -> EngineResult<Vec<Volume>> {
        Ok(load_file::<VolumesData>(&self.volumes_file())
            .await?
            .map(|data| data.volumes)
            .unwrap_or_default())
    }
}

async fn load_file<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    if !path.exists() {
        debug!("No state file at {:?}, starting fresh", path);
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;
    Ok(Some(serde_json::from_str(&content)?))
}

async fn save_file<T: Serialize>(path: &Path, data: &T) -> EngineResult<()> {
    let content = serde_json::to_string_pretty(data)?;

    // Write to temp file first, then rename (atomic)
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &content).await?;
    fs::rename(&temp_path, path).await?;

    Ok(())
}

#[async_trait]
impl BackupRepository for JsonFileRepository {
    async fn get_backup(&self, id: &str) -> EngineResult<Backup> {
        let _guard = self.lock.lock().await;
        self.load_backups()
            .await?
            .into_iter()
            .find(|b| b.id == id)
            .ok_or_else(|| EngineError::BackupNotFound(id.to_string()))
    }

    async fn save_backup(&self, backup: &Backup) -> EngineResult<()> {
        let _guard = self.lock.lock().await;
        let mut backups = self.load_backups().await?;
        match backups.iter_mut().find(|b| b.id == backup.id) {
            Some(existing) => *existing = backup.clone(),
            None => backups.push(backup.clone()),
        }

        let data = BackupsData {
            version: STATE_VERSION,
            backups,
        };
        save_file(&self.backups_file(), &data).await
    }

    async fn list_backups(&self) -> EngineResult<Vec<Backup>> {
        let _guard = self.lock.lock().await;
        self.load_backups().await
    }
}

#[async_trait]
impl VolumeRepository for JsonFileRepository {
    async fn get_volume(&self, id: &str) -> EngineResult<Volume> {
        let _guard = self.lock.lock().await;
        self.load_volumes()
            .await?
            .into_iter()
            .find(|v| v.id == id)
            .ok_or_else(|| EngineError::VolumeNotFound(id.to_string()))
    }

    async fn save_volume(&self, volume: &Volume) -> EngineResult<()> {
        let _guard = self.lock.lock().await;
        let mut volumes = self.load_volumes().await?;
        match volumes.iter_mut().find(|v| v.id == volume.id) {
            Some(existing) => *existing = volume.clone(),
            None => volumes.push(volume.clone()),
        }

        let data = VolumesData {
            version: STATE_VERSION,
            volumes,
        };
        save_file(&self.volumes_file(), &data).await
    }

    async fn list_volumes(&self) -> EngineResult<Vec<Volume>> {
        let _guard = self.lock.lock().await;
        self.load_volumes().await
    }
}
