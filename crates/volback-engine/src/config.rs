//! Engine configuration

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use volback_core::{validate_chunking, Compression, CHUNK_SIZE_DEFAULT, SHA_BLOCK_SIZE_DEFAULT};
use volback_storage::{LocalBackend, ObjectStore, S3Backend, S3Config};

use crate::error::{EngineError, EngineResult};

/// Backup engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of each chunk object, before compression
    pub chunk_size_bytes: usize,
    /// Size of each integrity block; must divide the chunk size
    pub sha_block_size_bytes: usize,
    /// Compression applied to new chunk objects
    pub compression: String,
    /// Container used when a backup names none
    pub default_container: String,
    /// Emit a progress notification every N chunks
    pub progress_interval_chunks: u64,
    /// Chunk uploads allowed in flight at once
    pub max_inflight_uploads: usize,
    /// Chunk objects fetched ahead of the restore write position
    pub restore_prefetch: usize,
    /// Check integrity digests of restored data
    pub verify_on_restore: bool,
    /// Object store backend
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: CHUNK_SIZE_DEFAULT,
            sha_block_size_bytes: SHA_BLOCK_SIZE_DEFAULT,
            compression: "zlib".to_string(),
            default_container: "volumebackups".to_string(),
            progress_interval_chunks: 1,
            max_inflight_uploads: 1,
            restore_prefetch: 2,
            verify_on_restore: true,
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create config with local storage
    pub fn local(path: &str) -> Self {
        Self {
            storage: StorageConfig::Local {
                path: path.to_string(),
            },
            ..Default::default()
        }
    }

    /// Set chunk and integrity block sizes
    pub fn with_chunking(mut self, chunk_size_bytes: usize, sha_block_size_bytes: usize) -> Self {
        self.chunk_size_bytes = chunk_size_bytes;
        self.sha_block_size_bytes = sha_block_size_bytes;
        self
    }

    /// Set compression algorithm name
    pub fn with_compression(mut self, name: &str) -> Self {
        self.compression = name.to_string();
        self
    }

    /// Defaults overlaid with `VOLBACK_*` environment variables
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("VOLBACK_CHUNK_SIZE") {
            config.chunk_size_bytes = parse_env("VOLBACK_CHUNK_SIZE", &size)?;
        }
        if let Ok(size) = std::env::var("VOLBACK_SHA_BLOCK_SIZE") {
            config.sha_block_size_bytes = parse_env("VOLBACK_SHA_BLOCK_SIZE", &size)?;
        }
        if let Ok(name) = std::env::var("VOLBACK_COMPRESSION") {
            config.compression = name;
        }
        if let Ok(container) = std::env::var("VOLBACK_CONTAINER") {
            config.default_container = container;
        }
        if let Ok(n) = std::env::var("VOLBACK_MAX_INFLIGHT_UPLOADS") {
            config.max_inflight_uploads = parse_env("VOLBACK_MAX_INFLIGHT_UPLOADS", &n)?;
        }

        if let Ok(bucket) = std::env::var("VOLBACK_S3_BUCKET") {
            config.storage = StorageConfig::S3 {
                bucket,
                region: std::env::var("VOLBACK_S3_REGION").ok(),
                endpoint: std::env::var("VOLBACK_S3_ENDPOINT").ok(),
                prefix: std::env::var("VOLBACK_S3_PREFIX").ok(),
            };
        } else if let Ok(path) = std::env::var("VOLBACK_DATA_DIR") {
            config.storage = StorageConfig::Local { path };
        }

        Ok(config)
    }

    /// Check the configuration before any backup runs
    pub fn validate(&self) -> EngineResult<()> {
        self.compression()?;
        validate_chunking(self.chunk_size_bytes, self.sha_block_size_bytes)?;
        if self.max_inflight_uploads == 0 {
            return Err(EngineError::Config(
                "max_inflight_uploads must be at least 1".into(),
            ));
        }
        if self.restore_prefetch == 0 {
            return Err(EngineError::Config("restore_prefetch must be at least 1".into()));
        }
        Ok(())
    }

    /// Compressor selected by name
    pub fn compression(&self) -> EngineResult<Compression> {
        Ok(Compression::select(&self.compression)?)
    }

    /// Container for backups that name none.
    ///
    /// With S3 storage the configured bucket takes precedence.
    pub fn container(&self) -> &str {
        match &self.storage {
            StorageConfig::S3 { bucket, .. } => bucket,
            StorageConfig::Local { .. } => &self.default_container,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> EngineResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{} has invalid value {:?}", name, value)))
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Local filesystem
    #[serde(rename = "local")]
    Local { path: String },
    /// S3-compatible storage
    #[serde(rename = "s3")]
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        prefix: Option<String>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: "/var/lib/volback".to_string(),
        }
    }
}

impl StorageConfig {
    /// Open the configured backend
    pub async fn open(&self) -> EngineResult<Arc<dyn ObjectStore>> {
        match self {
            StorageConfig::Local { path } => Ok(Arc::new(LocalBackend::new(path).await?)),
            StorageConfig::S3 {
                region,
                endpoint,
                prefix,
                ..
            } => {
                let mut config = S3Config {
                    region: region.clone(),
                    endpoint: endpoint.clone(),
                    prefix: None,
                };
                if let Some(prefix) = prefix {
                    config = config.with_prefix(prefix);
                }
                Ok(Arc::new(S3Backend::new(config).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size_bytes, 52_428_800);
        assert_eq!(config.sha_block_size_bytes, 32_768);
        assert_eq!(config.compression, "zlib");
        assert_eq!(config.container(), "volumebackups");
        assert_eq!(config.max_inflight_uploads, 1);
        assert!(config.verify_on_restore);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig::default().with_compression("winzip");
        assert!(matches!(config.validate().unwrap_err(), EngineError::Config(_)));

        let config = EngineConfig::default().with_chunking(1000, 300);
        assert!(matches!(
            config.validate().unwrap_err(),
            EngineError::InvalidBackup(_)
        ));

        let config = EngineConfig {
            max_inflight_uploads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate().unwrap_err(), EngineError::Config(_)));
    }

    #[test]
    fn test_s3_bucket_is_container() {
        let config = EngineConfig {
            storage: StorageConfig::S3 {
                bucket: "backups-eu".into(),
                region: Some("eu-west-1".into()),
                endpoint: None,
                prefix: None,
            },
            ..Default::default()
        };
        assert_eq!(config.container(), "backups-eu");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"chunk_size_bytes": 65536, "storage": {"type": "local", "path": "/tmp/vb"}}"#,
        )
        .unwrap();
        assert_eq!(config.chunk_size_bytes, 65536);
        assert_eq!(config.sha_block_size_bytes, 32_768);
        assert!(matches!(config.storage, StorageConfig::Local { path } if path == "/tmp/vb"));
    }

    #[test]
    fn test_storage_config_serialization() {
        let s3 = StorageConfig::S3 {
            bucket: "test".to_string(),
            region: Some("us-east-1".to_string()),
            endpoint: None,
            prefix: None,
        };
        let json = serde_json::to_string(&s3).unwrap();
        assert!(json.contains(r#""type":"s3""#));
        assert!(json.contains("test"));
    }
}
