//! Chunked, content-verified, incremental backup engine
//!
//! This crate splits block-volume streams into compressed chunk objects,
//! reuses unchanged chunks of a parent backup, restores volumes with
//! per-block verification and deletes backups scoped to their own objects.

pub mod chunker;
pub mod config;
pub mod error;
pub mod notify;
pub mod persistence;
pub mod records;
pub mod restore;
pub mod restore_factory;
pub mod service;

pub use config::{EngineConfig, StorageConfig};
pub use error::{EngineError, EngineResult, Phase};
pub use notify::{CollectingProgress, Operation, ProgressEvent, ProgressSink, TracingProgress};
pub use persistence::JsonFileRepository;
pub use records::{
    Backup, BackupRepository, BackupStatus, InMemoryRepository, Volume, VolumeRepository,
    VolumeStatus, GIB,
};
pub use service::{BackupRequest, BackupService, CloneRelation};
