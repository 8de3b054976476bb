//! Local filesystem storage backend
//!
//! Containers are directories under the root; object names map to
//! relative paths inside them:
//! - <root>/<container>/<name>

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::backend::ObjectStore;
use crate::error::{StorageError, StorageResult};

/// Suffix of in-flight writes; never listed
const TEMP_SUFFIX: &str = ".volback-tmp";

/// Local filesystem storage backend
pub struct LocalBackend {
    /// Root directory
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get container directory
    fn container_path(&self, container: &str) -> StorageResult<PathBuf> {
        if container.is_empty() || container.contains('/') || container == "." || container == ".."
        {
            return Err(StorageError::InvalidName(container.to_string()));
        }
        Ok(self.root.join(container))
    }

    /// Get object path, rejecting names that escape the container
    fn object_path(&self, container: &str, name: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && !name.ends_with(TEMP_SUFFIX)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.container_path(container)?.join(relative))
    }

    /// Remove now-empty directories between `path` and the container
    async fn prune_empty_dirs(&self, container_dir: &Path, path: &Path) {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == container_dir || !current.starts_with(container_dir) {
                break;
            }
            // Fails on the first directory that still holds something
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    /// Ensure parent directory exists
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    #[instrument(skip(self))]
    async fn create_container(&self, container: &str) -> StorageResult<()> {
        let path = self.container_path(container)?;
        fs::create_dir_all(&path).await?;
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
        let container_path = self.container_path(container)?;
        if !container_path.is_dir() {
            return Err(StorageError::ContainerNotFound(container.to_string()));
        }
        if extra_metadata.is_some() {
            debug!("Local backend does not keep extra object metadata");
        }

        let path = self.object_path(container, name)?;
        self.ensure_parent(&path).await?;

        // Write atomically using temp file + rename
        let mut temp_name = path.as_os_str().to_os_string();
        temp_name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_name);

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        let path = self.object_path(container, name)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(container, name))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, container: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let container_path = self.container_path(container)?;
        if !container_path.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = list_files_recursive(&container_path, &container_path)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(prefix) && !name.ends_with(TEMP_SUFFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn delete(&self, container: &str, name: &str) -> StorageResult<()> {
        let path = self.object_path(container, name)?;

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {} // Already deleted
            Err(e) => return Err(StorageError::Io(e)),
        }

        self.prune_empty_dirs(&self.container_path(container)?, &path)
            .await;
        Ok(())
    }
}

/// Recursively list files, returning `/`-separated paths relative to base
async fn list_files_recursive(dir: &Path, base: &Path) -> StorageResult<Vec<String>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let path = entry.path();

        if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(base) {
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
        } else if file_type.is_dir() {
            let mut sub_files = Box::pin(list_files_recursive(&path, base)).await?;
            files.append(&mut sub_files);
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_object_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path()).await.unwrap();
        backend.create_container("backups").await.unwrap();

        let name = "volume_v1/20240101000000/az_None_backup_b1-00001";
        let data = Bytes::from("chunk payload");

        backend
            .put("backups", name, data.clone(), None)
            .await
            .unwrap();
        assert_eq!(backend.get("backups", name).await.unwrap(), data);

        backend.delete("backups", name).await.unwrap();
        let err = backend.get("backups", name).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_directories() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path()).await.unwrap();
        backend.create_container("c").await.unwrap();

        backend
            .put("c", "vol/20240101/b1-00001", Bytes::from("x"), None)
            .await
            .unwrap();
        backend
            .put("c", "vol/other", Bytes::from("y"), None)
            .await
            .unwrap();

        backend.delete("c", "vol/20240101/b1-00001").await.unwrap();
        let container = temp_dir.path().join("c");
        assert!(!container.join("vol/20240101").exists());
        // Sibling object keeps its directory alive
        assert!(container.join("vol").is_dir());

        backend.delete("c", "vol/other").await.unwrap();
        assert!(!container.join("vol").exists());
        assert!(container.is_dir());
        assert!(backend.list("c", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_requires_container() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path()).await.unwrap();

        let err = backend
            .put("missing", "obj", Bytes::from("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_by_string_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path()).await.unwrap();
        backend.create_container("c").await.unwrap();

        for name in ["vol/b1-00001", "vol/b1-00002", "vol/b1_metadata", "vol/b2-00001"] {
            backend.put("c", name, Bytes::from("x"), None).await.unwrap();
        }

        let listed = backend.list("c", "vol/b1").await.unwrap();
        assert_eq!(listed, vec!["vol/b1-00001", "vol/b1-00002", "vol/b1_metadata"]);

        assert!(backend.list("absent", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path()).await.unwrap();
        backend.create_container("c").await.unwrap();

        backend.delete("c", "never-written").await.unwrap();
        backend.delete("c", "never-written").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path()).await.unwrap();
        backend.create_container("c").await.unwrap();

        for name in ["../outside", "/abs", "a/../../b", ""] {
            let err = backend.get("c", name).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidName(_)), "{}", name);
        }
        assert!(matches!(
            backend.create_container("a/b").await.unwrap_err(),
            StorageError::InvalidName(_)
        ));
    }
}
