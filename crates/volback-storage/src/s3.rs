//! S3-compatible storage backend
//!
//! Containers map to buckets. Object names are used as keys, optionally
//! below a global key prefix:
//! - [{prefix}/]{name}

use async_trait::async_trait;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::{primitives::ByteStream, Client};
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::backend::ObjectStore;
use crate::error::{StorageError, StorageResult};

/// Object metadata key carrying the backend's extra metadata string
const EXTRA_METADATA_KEY: &str = "volback-extra";

/// S3 storage backend configuration
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Optional prefix for all keys
    pub prefix: Option<String>,
    /// Region (for AWS S3)
    pub region: Option<String>,
    /// Endpoint URL (for MinIO, R2, etc.)
    pub endpoint: Option<String>,
}

impl S3Config {
    /// Create config for AWS S3
    pub fn aws(region: &str) -> Self {
        Self {
            prefix: None,
            region: Some(region.to_string()),
            endpoint: None,
        }
    }

    /// Create config for S3-compatible service (MinIO, R2, etc.)
    pub fn compatible(endpoint: &str) -> Self {
        Self {
            prefix: None,
            region: None,
            endpoint: Some(endpoint.to_string()),
        }
    }

    /// Set a key prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.trim_end_matches('/').to_string());
        self
    }
}

/// S3 storage backend
pub struct S3Backend {
    client: Client,
    config: S3Config,
}

impl S3Backend {
    /// Create a new S3 backend
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        let mut aws_config = aws_config::from_env();

        if let Some(region) = &config.region {
            aws_config = aws_config.region(aws_sdk_s3::config::Region::new(region.clone()));
        }

        if let Some(endpoint) = &config.endpoint {
            aws_config = aws_config.endpoint_url(endpoint);
        }

        let sdk_config = aws_config.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some()) // Use path style for non-AWS
            .build();

        let client = Client::from_conf(s3_config);

        Ok(Self { client, config })
    }

    /// Apply optional prefix
    fn key(&self, name: &str) -> String {
        apply_prefix(self.config.prefix.as_deref(), name)
    }

    /// Strip the global prefix from a listed key
    fn strip_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.config.prefix {
            Some(p) => key.strip_prefix(p.as_str())?.strip_prefix('/'),
            None => Some(key),
        }
    }
}

/// Join a global key prefix and an object name
fn apply_prefix(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    #[instrument(skip(self))]
    async fn create_container(&self, container: &str) -> StorageResult<()> {
        match self.client.head_bucket().bucket(container).send().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let service_error = e.into_service_error();
                if !service_error.is_not_found() {
                    return Err(StorageError::S3(service_error.to_string()));
                }
            }
        }

        debug!("Creating bucket");
        let mut request = self.client.create_bucket().bucket(container);
        if let Some(region) = self.config.region.as_deref().filter(|r| *r != "us-east-1") {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| StorageError::S3(e.into_service_error().to_string()))?;

        Ok(())
    }

    #[instrument(skip(self, data, extra_metadata), fields(size = data.len()))]
    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        extra_metadata: Option<&str>,
    ) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(container)
            .key(self.key(name))
            .body(ByteStream::from(data));
        if let Some(extra) = extra_metadata {
            request = request.metadata(EXTRA_METADATA_KEY, extra);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::S3(e.into_service_error().to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        let response = match self
            .client
            .get_object()
            .bucket(container)
            .key(self.key(name))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(StorageError::not_found(container, name));
                }
                return Err(StorageError::S3(service_error.to_string()));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        Ok(data.into_bytes())
    }

    async fn list(&self, container: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.key(prefix);
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(container)
                .prefix(&full_prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::S3(e.into_service_error().to_string()))?;

            for object in response.contents.unwrap_or_default() {
                if let Some(name) = object.key.as_deref().and_then(|k| self.strip_key(k)) {
                    names.push(name.to_string());
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn delete(&self, container: &str, name: &str) -> StorageResult<()> {
        // S3 reports success for absent keys
        self.client
            .delete_object()
            .bucket(container)
            .key(self.key(name))
            .send()
            .await
            .map_err(|e| StorageError::S3(e.into_service_error().to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefixing() {
        assert_eq!(apply_prefix(None, "vol/b-00001"), "vol/b-00001");
        assert_eq!(
            apply_prefix(Some("tenant-a"), "vol/b-00001"),
            "tenant-a/vol/b-00001"
        );
    }

    #[test]
    fn test_config_prefix_trimmed() {
        let config = S3Config::compatible("http://localhost:9000").with_prefix("backups/");
        assert_eq!(config.prefix.as_deref(), Some("backups"));
        assert!(config.region.is_none());

        let config = S3Config::aws("eu-west-1");
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
    }
}
