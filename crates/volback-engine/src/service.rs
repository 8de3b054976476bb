//! Backup service - orchestrates backup, restore and delete
//!
//! Drives the chunk and restore engines, persists metadata documents and
//! moves backup and volume records through their status lifecycles.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use volback_core::{
    index, validate_chunking, DocumentHeader, MetadataDocument, MetadataVersion, ObjectNaming,
    PrefixSeed, ShaFile,
};
use volback_storage::{MetadataCodec, ObjectStore, StorageError};

use crate::chunker::{ChunkEngine, ChunkSettings, ParentState};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, Phase, ResultExt};
use crate::notify::{Operation, ProgressSink, ProgressTracker, TracingProgress};
use crate::records::{
    Backup, BackupRepository, BackupStatus, Volume, VolumeRepository, VolumeStatus,
};
use crate::restore::RestoreEngine;
use crate::restore_factory::{capture_volume_meta, restore_volume_meta};

/// How a restore destination relates to the backup being restored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneRelation {
    Unrelated,
    /// The volume was last restored from this very backup
    CloneOfBackup,
    /// The volume was last restored from an ancestor of this backup
    CloneOfAncestor(String),
}

/// Options for a new backup record
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub volume_id: String,
    pub parent_id: Option<String>,
    pub container: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Backup orchestrator
pub struct BackupService {
    config: EngineConfig,
    store: Arc<dyn ObjectStore>,
    codec: MetadataCodec,
    backups: Arc<dyn BackupRepository>,
    volumes: Arc<dyn VolumeRepository>,
    progress: Arc<dyn ProgressSink>,
}

impl BackupService {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ObjectStore>,
        backups: Arc<dyn BackupRepository>,
        volumes: Arc<dyn VolumeRepository>,
    ) -> Self {
        Self {
            config,
            codec: MetadataCodec::new(store.clone()),
            store,
            backups,
            volumes,
            progress: Arc::new(TracingProgress),
        }
    }

    /// Replace the progress sink
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backups(&self) -> Arc<dyn BackupRepository> {
        self.backups.clone()
    }

    pub fn volumes(&self) -> Arc<dyn VolumeRepository> {
        self.volumes.clone()
    }

    /// Create a backup record in `creating` status
    pub async fn create_backup(&self, request: BackupRequest) -> EngineResult<Backup> {
        let volume = self.volumes.get_volume(&request.volume_id).await?;

        let mut backup = Backup::new(Uuid::new_v4().to_string(), volume.id.clone());
        backup.parent_id = request.parent_id;
        backup.container = request.container;
        backup.display_name = request.name;
        backup.display_description = request.description;
        backup.availability_zone = volume.availability_zone.clone();
        self.backups.save_backup(&backup).await?;

        debug!(backup_id = %backup.id, volume_id = %volume.id, "Created backup record");
        Ok(backup)
    }

    /// Back up a volume stream into the backup `backup_id`.
    ///
    /// The record must be in `creating` status; it ends `available` or
    /// `error`.
    #[instrument(skip(self, reader, cancel))]
    pub async fn backup<R>(
        &self,
        backup_id: &str,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> EngineResult<Backup>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut backup = self.backups.get_backup(backup_id).await?;
        if backup.status != BackupStatus::Creating {
            return Err(EngineError::InvalidBackup(format!(
                "backup {} is {}, expected creating",
                backup.id, backup.status
            ))
            .in_phase(Phase::Prepare));
        }
        let mut volume = self.volumes.get_volume(&backup.volume_id).await?;
        let previous_status = volume.status;
        if !matches!(previous_status, VolumeStatus::Available | VolumeStatus::InUse) {
            let e = EngineError::InvalidVolume(format!(
                "volume {} is {}, expected available or in-use",
                volume.id, volume.status
            ))
            .in_phase(Phase::Prepare);
            self.record_backup_failure(&mut backup, &e).await;
            return Err(e);
        }
        volume.status = VolumeStatus::BackingUp;
        self.volumes.save_volume(&volume).await?;

        let result = match self.run_backup(&mut backup, &volume, reader, cancel).await {
            // Another operation may have taken over the record meanwhile
            Ok(()) => self
                .ensure_still_creating(&backup.id)
                .await
                .in_phase(Phase::MetadataWrite),
            Err(e) => Err(e),
        };
        self.release_volume(&volume.id, previous_status).await;

        match result {
            Ok(()) => {
                backup.set_status(BackupStatus::Available, None);
                self.backups.save_backup(&backup).await?;
                info!(
                    backup_id = %backup.id,
                    objects = backup.object_count,
                    size = backup.size,
                    "Backup completed"
                );
                Ok(backup)
            }
            Err(e) => {
                warn!(backup_id = %backup.id, error = %e, "Backup failed");
                self.record_backup_failure(&mut backup, &e).await;
                Err(e)
            }
        }
    }

    /// Mark a failed backup `error`, unless its record has moved on
    async fn record_backup_failure(&self, backup: &mut Backup, error: &EngineError) {
        match self.backups.get_backup(&backup.id).await {
            Ok(current) if current.status == BackupStatus::Creating => {
                backup.set_status(BackupStatus::Error, Some(error.to_string()));
                if let Err(save_err) = self.backups.save_backup(backup).await {
                    warn!(error = %save_err, "Failed to record backup failure");
                }
            }
            Ok(current) => warn!(
                backup_id = %backup.id,
                status = %current.status,
                "Backup record changed during the run, leaving it as is"
            ),
            Err(get_err) => warn!(error = %get_err, "Failed to reload backup record"),
        }
    }

    /// Fails unless the stored record of `backup_id` is still `creating`
    async fn ensure_still_creating(&self, backup_id: &str) -> EngineResult<()> {
        let current = self.backups.get_backup(backup_id).await?;
        if current.status != BackupStatus::Creating {
            return Err(EngineError::InvalidBackup(format!(
                "backup {} became {} while it was being written",
                backup_id, current.status
            )));
        }
        Ok(())
    }

    /// Put a volume back into the status it had before its backup
    async fn release_volume(&self, volume_id: &str, status: VolumeStatus) {
        match self.volumes.get_volume(volume_id).await {
            Ok(mut volume) if volume.status == VolumeStatus::BackingUp => {
                volume.status = status;
                if let Err(e) = self.volumes.save_volume(&volume).await {
                    warn!(volume_id, error = %e, "Failed to release volume after backup");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(volume_id, error = %e, "Failed to reload volume after backup"),
        }
    }

    async fn run_backup<R>(
        &self,
        backup: &mut Backup,
        volume: &Volume,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> EngineResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        // Nothing touches the object store before these pass
        let settings = self.check_preconditions(volume).in_phase(Phase::Prepare)?;

        let container = self.container_of(backup);
        self.store
            .create_container(&container)
            .await
            .in_phase(Phase::Prepare)?;
        backup.container = Some(container.clone());

        let prefix = match &backup.service_metadata {
            Some(prefix) => prefix.clone(),
            None => {
                let seed = PrefixSeed {
                    volume_id: backup.volume_id.clone(),
                    backup_id: backup.id.clone(),
                    availability_zone: backup.availability_zone.clone(),
                    created_at: backup.created_at,
                };
                let prefix = self.store.object_prefix(&seed);
                backup.service_metadata = Some(prefix.clone());
                prefix
            }
        };
        self.backups.save_backup(backup).await?;
        let naming = ObjectNaming::new(prefix);

        let parent = match backup.parent_id.clone() {
            Some(parent_id) => Some(
                self.load_parent(backup, &parent_id, &container)
                    .await
                    .in_phase(Phase::Prepare)?,
            ),
            None => None,
        };

        info!(
            backup_id = %backup.id,
            prefix = %naming.prefix(),
            incremental = parent.is_some(),
            "Starting backup"
        );

        let mut progress = ProgressTracker::new(
            self.progress.clone(),
            Operation::Backup,
            &backup.id,
            &backup.volume_id,
            volume.size_bytes(),
            self.config.progress_interval_chunks,
        );
        let extra_metadata = self.store.extra_metadata(&container, naming.prefix());
        let engine = ChunkEngine::new(self.store.clone(), &container, naming.clone(), settings)
            .with_extra_metadata(extra_metadata);
        let mut outcome = engine
            .run(reader, parent.as_ref(), &mut progress, cancel)
            .await
            .in_phase(Phase::ChunkWrite)?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.in_phase(Phase::ChunkWrite));
        }

        outcome.index.volume_meta = Some(
            capture_volume_meta(volume)
                .to_json()
                .in_phase(Phase::MetadataWrite)?,
        );
        let header = DocumentHeader {
            backup_id: backup.id.clone(),
            volume_id: backup.volume_id.clone(),
            backup_name: backup.display_name.clone(),
            backup_description: backup.display_description.clone(),
        };

        self.ensure_still_creating(&backup.id)
            .await
            .in_phase(Phase::MetadataWrite)?;

        // The metadata object goes last: its presence marks a complete backup
        let sha_file = ShaFile::from_index(
            &header,
            self.config.sha_block_size_bytes as u64,
            &outcome.shas,
        );
        self.codec
            .write_sha_file(&container, &naming, &sha_file)
            .await
            .in_phase(Phase::MetadataWrite)?;

        let document = MetadataDocument::from_index(
            &header,
            backup.parent_id.clone(),
            self.config.chunk_size_bytes as u64,
            &outcome.index,
        );
        self.codec
            .write_metadata(&container, &naming, &document)
            .await
            .in_phase(Phase::MetadataWrite)?;

        progress.finish();
        backup.object_count = outcome.objects_written;
        backup.size = outcome.bytes_read;
        debug!(
            reused = outcome.chunks_reused,
            listed = document.objects.len(),
            "Backup metadata written"
        );
        Ok(())
    }

    /// Precondition checks, in order: volume size, chunking, compressor
    fn check_preconditions(&self, volume: &Volume) -> EngineResult<ChunkSettings> {
        if volume.size == 0 {
            return Err(EngineError::InvalidVolume(format!(
                "volume {} has size 0",
                volume.id
            )));
        }
        validate_chunking(self.config.chunk_size_bytes, self.config.sha_block_size_bytes)?;
        let compression = self.config.compression()?;

        Ok(ChunkSettings {
            chunk_size: self.config.chunk_size_bytes,
            block_size: self.config.sha_block_size_bytes,
            compression,
            max_inflight: self.config.max_inflight_uploads.max(1),
        })
    }

    async fn load_parent(
        &self,
        backup: &Backup,
        parent_id: &str,
        container: &str,
    ) -> EngineResult<ParentState> {
        let parent = self.backups.get_backup(parent_id).await?;
        if parent.status != BackupStatus::Available {
            return Err(EngineError::InvalidBackup(format!(
                "parent backup {} is {}",
                parent.id, parent.status
            )));
        }
        if parent.volume_id != backup.volume_id {
            return Err(EngineError::InvalidBackup(format!(
                "parent backup {} belongs to volume {}",
                parent.id, parent.volume_id
            )));
        }
        let (parent_container, naming) = self.locate(&parent)?;
        if parent_container != container {
            return Err(EngineError::InvalidBackup(format!(
                "parent backup {} is in container {}, not {}",
                parent.id, parent_container, container
            )));
        }

        let document = self.codec.read_metadata(container, &naming).await?;
        document.schema_version()?;
        if document.chunk_size != self.config.chunk_size_bytes as u64 {
            return Err(EngineError::InvalidBackup(format!(
                "parent backup {} uses {}-byte chunks, configured {}",
                parent.id, document.chunk_size, self.config.chunk_size_bytes
            )));
        }

        let sha_file = self.codec.read_sha_file(container, &naming).await?;
        sha_file.schema_version()?;
        if sha_file.chunk_size != self.config.sha_block_size_bytes as u64 {
            return Err(EngineError::InvalidBackup(format!(
                "parent backup {} uses {}-byte sha blocks, configured {}",
                parent.id, sha_file.chunk_size, self.config.sha_block_size_bytes
            )));
        }

        Ok(ParentState {
            objects: document.objects,
            sha256s: sha_file.sha256s,
        })
    }

    /// Restore backup `backup_id` into volume `volume_id` through `writer`.
    ///
    /// The destination ends `available` with its saved attributes
    /// re-applied, or `error_restoring`.
    #[instrument(skip(self, writer, cancel))]
    pub async fn restore<W>(
        &self,
        backup_id: &str,
        volume_id: &str,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> EngineResult<Volume>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send,
    {
        let mut backup = self.backups.get_backup(backup_id).await?;
        if backup.status != BackupStatus::Available {
            return Err(EngineError::InvalidBackup(format!(
                "backup {} is {}, expected available",
                backup.id, backup.status
            ))
            .in_phase(Phase::Prepare));
        }
        let mut volume = self.volumes.get_volume(volume_id).await?;
        if volume.status != VolumeStatus::Available {
            return Err(EngineError::InvalidVolume(format!(
                "volume {} is {}, expected available",
                volume.id, volume.status
            ))
            .in_phase(Phase::Prepare));
        }

        match self.is_volume_backup_clone(&volume, &backup).await? {
            CloneRelation::Unrelated => {}
            relation => info!(
                volume_id = %volume.id,
                backup_id = %backup.id,
                ?relation,
                "Destination was restored from this backup chain, restoring in full"
            ),
        }

        backup.set_status(BackupStatus::Restoring, None);
        self.backups.save_backup(&backup).await?;
        volume.status = VolumeStatus::RestoringBackup;
        self.volumes.save_volume(&volume).await?;

        let result = self.run_restore(&backup, &volume, writer, cancel).await;

        backup.set_status(BackupStatus::Available, None);
        self.backups.save_backup(&backup).await?;

        match result {
            Ok(mut restored) => {
                restored.status = VolumeStatus::Available;
                restored.restored_from_backup_id = Some(backup.id.clone());
                self.volumes.save_volume(&restored).await?;
                info!(backup_id = %backup.id, volume_id = %restored.id, "Restore completed");
                Ok(restored)
            }
            Err(e) => {
                warn!(backup_id = %backup.id, volume_id = %volume.id, error = %e, "Restore failed");
                volume.status = VolumeStatus::ErrorRestoring;
                if let Err(save_err) = self.volumes.save_volume(&volume).await {
                    warn!(error = %save_err, "Failed to record restore failure");
                }
                Err(e)
            }
        }
    }

    async fn run_restore<W>(
        &self,
        backup: &Backup,
        volume: &Volume,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> EngineResult<Volume>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send,
    {
        let (container, naming) = self.locate(backup).in_phase(Phase::Prepare)?;

        let document = self
            .codec
            .read_metadata(&container, &naming)
            .await
            .in_phase(Phase::RestoreFetch)?;
        match document.schema_version().in_phase(Phase::RestoreFetch)? {
            MetadataVersion::V1 => {}
        }

        let sha_file = if self.config.verify_on_restore {
            let file = self
                .codec
                .read_sha_file(&container, &naming)
                .await
                .in_phase(Phase::RestoreFetch)?;
            file.schema_version().in_phase(Phase::RestoreFetch)?;
            Some(file)
        } else {
            None
        };

        let needed = index::live_entries(&document.objects)
            .into_iter()
            .map(|entry| entry.record.end())
            .max()
            .unwrap_or(0)
            .max(backup.size);
        if volume.size_bytes() < needed {
            return Err(EngineError::InvalidVolume(format!(
                "volume {} holds {} bytes, backup {} needs {}",
                volume.id,
                volume.size_bytes(),
                backup.id,
                needed
            ))
            .in_phase(Phase::Prepare));
        }

        let mut progress = ProgressTracker::new(
            self.progress.clone(),
            Operation::Restore,
            &backup.id,
            &volume.id,
            backup.size,
            self.config.progress_interval_chunks,
        );
        let engine = RestoreEngine::new(self.store.clone(), &container, self.config.restore_prefetch);
        let outcome = engine
            .run(&document, sha_file.as_ref(), writer, &mut progress, cancel)
            .await
            .in_phase(Phase::RestoreApply)?;
        progress.finish();
        debug!(
            fetched = outcome.objects_fetched,
            skipped = outcome.objects_skipped,
            bytes = outcome.bytes_written,
            "Volume data restored"
        );

        let mut restored = volume.clone();
        if let Some(blob) = &document.volume_meta {
            restore_volume_meta(blob, &mut restored).in_phase(Phase::RestoreApply)?;
        }
        Ok(restored)
    }

    /// Delete a backup and every object it wrote.
    ///
    /// Deleting an already deleted backup succeeds. A backup other backups
    /// depend on is refused.
    #[instrument(skip(self))]
    pub async fn delete_backup(&self, backup_id: &str) -> EngineResult<Backup> {
        let mut backup = self.backups.get_backup(backup_id).await?;
        match backup.status {
            BackupStatus::Deleted => {
                debug!(backup_id, "Backup already deleted");
                return Ok(backup);
            }
            BackupStatus::Available | BackupStatus::Error | BackupStatus::ErrorDeleting => {}
            other => {
                return Err(EngineError::InvalidBackup(format!(
                    "backup {} is {}, cannot delete",
                    backup.id, other
                ))
                .in_phase(Phase::Delete))
            }
        }

        let dependents = self.backups.dependents_of(&backup.id).await?;
        if !dependents.is_empty() {
            let ids: Vec<&str> = dependents.iter().map(|b| b.id.as_str()).collect();
            return Err(EngineError::InvalidBackup(format!(
                "backup {} has dependent backups: {}",
                backup.id,
                ids.join(", ")
            ))
            .in_phase(Phase::Delete));
        }

        backup.set_status(BackupStatus::Deleting, None);
        self.backups.save_backup(&backup).await?;

        match self.delete_objects(&backup).await {
            Ok(deleted) => {
                backup.set_status(BackupStatus::Deleted, None);
                self.backups.save_backup(&backup).await?;
                info!(backup_id = %backup.id, objects = deleted, "Backup deleted");
                Ok(backup)
            }
            Err(e) => {
                let e = e.in_phase(Phase::Delete);
                warn!(backup_id = %backup.id, error = %e, "Backup deletion failed");
                backup.set_status(BackupStatus::ErrorDeleting, Some(e.to_string()));
                if let Err(save_err) = self.backups.save_backup(&backup).await {
                    warn!(error = %save_err, "Failed to record deletion failure");
                }
                Err(e)
            }
        }
    }

    /// Delete own chunk objects, then the sha file and metadata object
    async fn delete_objects(&self, backup: &Backup) -> EngineResult<u64> {
        let Some(prefix) = backup.service_metadata.clone() else {
            debug!(backup_id = %backup.id, "Backup never wrote any objects");
            return Ok(0);
        };
        let container = self.container_of(backup);
        let naming = ObjectNaming::new(prefix);

        // Listed objects outside our prefix belong to ancestors
        let mut doomed = BTreeSet::new();
        match self.codec.read_metadata(&container, &naming).await {
            Ok(document) => doomed.extend(
                document
                    .objects
                    .into_iter()
                    .map(|entry| entry.name)
                    .filter(|name| naming.owns(name)),
            ),
            Err(StorageError::MetadataNotFound { .. }) => {
                warn!(backup_id = %backup.id, "Backup metadata missing, deleting by prefix scan")
            }
            Err(StorageError::Core(e)) => {
                warn!(backup_id = %backup.id, error = %e, "Backup metadata unreadable, deleting by prefix scan")
            }
            Err(e) => return Err(e.into()),
        }

        // Chunks written by an unfinished run are only found by listing
        for name in self.store.list(&container, naming.prefix()).await? {
            if naming.owns(&name) {
                doomed.insert(name);
            }
        }
        // These two go last
        doomed.remove(&naming.sha_object_name());
        doomed.remove(&naming.metadata_object_name());

        for name in &doomed {
            self.store.delete(&container, name).await?;
        }
        self.codec.delete_sha_file(&container, &naming).await?;
        self.codec.delete_metadata(&container, &naming).await?;

        Ok(doomed.len() as u64)
    }

    /// Whether `volume` was produced by restoring `backup` or one of its
    /// ancestors
    pub async fn is_volume_backup_clone(
        &self,
        volume: &Volume,
        backup: &Backup,
    ) -> EngineResult<CloneRelation> {
        let Some(source) = volume.restored_from_backup_id.as_deref() else {
            return Ok(CloneRelation::Unrelated);
        };
        if source == backup.id {
            return Ok(CloneRelation::CloneOfBackup);
        }

        let mut seen = HashSet::new();
        let mut next = backup.parent_id.clone();
        while let Some(id) = next {
            if id == source {
                return Ok(CloneRelation::CloneOfAncestor(id));
            }
            if !seen.insert(id.clone()) {
                break;
            }
            next = match self.backups.get_backup(&id).await {
                Ok(ancestor) => ancestor.parent_id,
                Err(EngineError::BackupNotFound(_)) => None,
                Err(e) => return Err(e),
            };
        }
        Ok(CloneRelation::Unrelated)
    }

    /// Read the metadata document of a finished backup
    pub async fn read_metadata(&self, backup_id: &str) -> EngineResult<MetadataDocument> {
        let backup = self.backups.get_backup(backup_id).await?;
        let (container, naming) = self.locate(&backup)?;
        Ok(self.codec.read_metadata(&container, &naming).await?)
    }

    fn container_of(&self, backup: &Backup) -> String {
        backup
            .container
            .clone()
            .unwrap_or_else(|| self.config.container().to_string())
    }

    /// Container and object naming of a backup that has run
    fn locate(&self, backup: &Backup) -> EngineResult<(String, ObjectNaming)> {
        let prefix = backup.service_metadata.clone().ok_or_else(|| {
            EngineError::InvalidBackup(format!("backup {} has no object prefix", backup.id))
        })?;
        Ok((self.container_of(backup), ObjectNaming::new(prefix)))
    }
}
