//! Engine error types

use std::fmt;
use thiserror::Error;
use volback_storage::StorageError;

/// Step of an operation an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    ChunkWrite,
    MetadataWrite,
    RestoreFetch,
    RestoreApply,
    Delete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::ChunkWrite => "chunk-write",
            Phase::MetadataWrite => "metadata-write",
            Phase::RestoreFetch => "restore-fetch",
            Phase::RestoreApply => "restore-apply",
            Phase::Delete => "delete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Backup metadata not found: {0}")]
    MetadataNotFound(String),

    #[error("Unsupported schema version: {0}")]
    SchemaVersionUnsupported(String),

    #[error("Encrypted backup operation failed: {0}")]
    EncryptedBackupOperationFailed(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Core error: {0}")]
    Core(volback_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// The error with every phase wrapper removed
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Phase the error was raised in, if known
    pub fn phase(&self) -> Option<Phase> {
        match self {
            EngineError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Tag the error with a phase unless it already carries one
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            e @ EngineError::Phase { .. } => e,
            other => EngineError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::MetadataNotFound { container, name } => {
                EngineError::MetadataNotFound(format!("{}/{}", container, name))
            }
            StorageError::Core(core) => core.into(),
            other => EngineError::Storage(other),
        }
    }
}

impl From<volback_core::Error> for EngineError {
    fn from(e: volback_core::Error) -> Self {
        use volback_core::Error as CoreError;
        match e {
            CoreError::UnknownCompressor(_) => EngineError::Config(e.to_string()),
            CoreError::UnsupportedVersion(version) => EngineError::SchemaVersionUnsupported(version),
            CoreError::BlockSizeMismatch { .. } | CoreError::InvalidChunking(_) => {
                EngineError::InvalidBackup(e.to_string())
            }
            CoreError::Decompression(_) | CoreError::InvalidDigest(_) => {
                EngineError::Corruption(e.to_string())
            }
            other => EngineError::Core(other),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Task(e.to_string())
    }
}

/// Attach a phase to the error of a result
pub trait ResultExt<T> {
    fn in_phase(self, phase: Phase) -> EngineResult<T>;
}

impl<T, E: Into<EngineError>> ResultExt<T> for Result<T, E> {
    fn in_phase(self, phase: Phase) -> EngineResult<T> {
        self.map_err(|e| e.into().in_phase(phase))
    }
}

/// Result type alias
pub type EngineResult<T> = Result<T, EngineError>;
