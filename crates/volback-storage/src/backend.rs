//! Object-store trait definition
//!
//! Backends store opaque objects by name inside a container (a bucket, a
//! directory, ...). Names may contain `/`.

use async_trait::async_trait;
use bytes::Bytes;
use volback_core::PrefixSeed;

use crate::error::StorageResult;

/// Object store used by the backup engine
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get backend name/type
    fn name(&self) -> &str;

    /// Make sure a container exists. Called once per backup.
    async fn create_container(&self, container: &str) -> StorageResult<()>;

    /// Write an object, replacing any previous content
    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        extra_metadata: Option<&str>,
    ) -> StorageResult<()>;

    /// Read an object
    async fn get(&self, container: &str, name: &str) -> StorageResult<Bytes>;

    /// List object names starting with `prefix`, sorted
    async fn list(&self, container: &str, prefix: &str) -> StorageResult<Vec<String>>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, container: &str, name: &str) -> StorageResult<()>;

    /// Generate the object-name prefix for a new backup
    fn object_prefix(&self, seed: &PrefixSeed) -> String {
        seed.default_prefix()
    }

    /// Backend-specific string recorded in the backup metadata
    fn extra_metadata(&self, _container: &str, _prefix: &str) -> Option<String> {
        None
    }
}
