//! Storage error types

use thiserror::Error;

/// Storage error type
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {container}/{name}")]
    NotFound { container: String, name: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Backup metadata not found: {container}/{name}")]
    MetadataNotFound { container: String, name: String },

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] volback_core::Error),
}

impl StorageError {
    pub fn not_found(container: &str, name: &str) -> Self {
        StorageError::NotFound {
            container: container.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether the error means the object is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. } | StorageError::MetadataNotFound { .. }
        )
    }
}

/// Result type alias
pub type StorageResult<T> = Result<T, StorageError>;
