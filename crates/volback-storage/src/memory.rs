//! In-memory storage backend
//!
//! Keeps objects in process memory. Counts every call and can be told to
//! fail puts, which makes it the backend of choice for engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::backend::ObjectStore;
use crate::error::{StorageError, StorageResult};

/// Number of calls made per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub create_containers: u64,
    pub puts: u64,
    pub gets: u64,
    pub lists: u64,
    pub deletes: u64,
}

impl OpCounts {
    pub fn total(&self) -> u64 {
        self.create_containers + self.puts + self.gets + self.lists + self.deletes
    }
}

#[derive(Default)]
struct Counters {
    create_containers: AtomicU64,
    puts: AtomicU64,
    gets: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryBackend {
    containers: RwLock<BTreeMap<String, BTreeMap<String, Bytes>>>,
    counters: Counters,
    /// Successful puts allowed before every put fails
    fail_puts_after: RwLock<Option<u64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the call counters
    pub fn op_counts(&self) -> OpCounts {
        OpCounts {
            create_containers: self.counters.create_containers.load(Ordering::SeqCst),
            puts: self.counters.puts.load(Ordering::SeqCst),
            gets: self.counters.gets.load(Ordering::SeqCst),
            lists: self.counters.lists.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    pub fn total_calls(&self) -> u64 {
        self.op_counts().total()
    }

    /// Let `n` more puts succeed, then fail every following put
    pub async fn fail_puts_after(&self, n: u64) {
        let done = self.counters.puts.load(Ordering::SeqCst);
        *self.fail_puts_after.write().await = Some(done + n);
    }

    /// Stop injecting put failures
    pub async fn clear_failures(&self) {
        *self.fail_puts_after.write().await = None;
    }

    /// Object names in a container, sorted
    pub async fn object_names(&self, container: &str) -> Vec<String> {
        self.containers
            .read()
            .await
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Overwrite an object without counting the call
    pub async fn tamper(&self, container: &str, name: &str, data: Bytes) {
        if let Some(objects) = self.containers.write().await.get_mut(container) {
            objects.insert(name.to_string(), data);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_container(&self, container: &str) -> StorageResult<()> {
        self.counters.create_containers.fetch_add(1, Ordering::SeqCst);
        self.containers
            .write()
            .await
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        _extra_metadata: Option<&str>,
    ) -> StorageResult<()> {
        let attempt = self.counters.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_puts_after.read().await {
            if attempt >= limit {
                return Err(StorageError::Backend(format!(
                    "injected put failure for {}",
                    name
                )));
            }
        }

        let mut containers = self.containers.write().await;
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?;
        objects.insert(name.to_string(), data);
        Ok(())
    }

    async fn get(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.containers
            .read()
            .await
            .get(container)
            .and_then(|objects| objects.get(name))
            .cloned()
            .ok_or_else(|| StorageError::not_found(container, name))
    }

    async fn list(&self, container: &str, prefix: &str) -> StorageResult<Vec<String>> {
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .containers
            .read()
            .await
            .get(container)
            .map(|objects| {
                objects
                    .range(prefix.to_string()..)
                    .take_while(|(name, _)| name.starts_with(prefix))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, container: &str, name: &str) -> StorageResult<()> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        if let Some(objects) = self.containers.write().await.get_mut(container) {
            objects.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_and_roundtrip() {
        let backend = MemoryBackend::new();
        backend.create_container("c").await.unwrap();
        backend
            .put("c", "p-00001", Bytes::from("abc"), None)
            .await
            .unwrap();
        assert_eq!(backend.get("c", "p-00001").await.unwrap(), Bytes::from("abc"));
        assert!(backend.get("c", "p-00002").await.unwrap_err().is_not_found());

        let counts = backend.op_counts();
        assert_eq!(counts.create_containers, 1);
        assert_eq!(counts.puts, 1);
        assert_eq!(counts.gets, 2);
        assert_eq!(backend.total_calls(), 4);
    }

    #[tokio::test]
    async fn test_list_prefix_range() {
        let backend = MemoryBackend::new();
        backend.create_container("c").await.unwrap();
        for name in ["a-00001", "ab-00001", "a_metadata", "b-00001"] {
            backend.put("c", name, Bytes::new(), None).await.unwrap();
        }
        assert_eq!(
            backend.list("c", "a").await.unwrap(),
            vec!["a-00001", "a_metadata", "ab-00001"]
        );
        assert!(backend.list("missing", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_put_failure() {
        let backend = MemoryBackend::new();
        backend.create_container("c").await.unwrap();
        backend.fail_puts_after(1).await;

        backend.put("c", "one", Bytes::new(), None).await.unwrap();
        let err = backend.put("c", "two", Bytes::new(), None).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(backend.object_names("c").await, vec!["one"]);

        backend.clear_failures().await;
        backend.put("c", "two", Bytes::new(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_into_missing_container() {
        let backend = MemoryBackend::new();
        let err = backend.put("nope", "x", Bytes::new(), None).await.unwrap_err();
        assert!(matches!(err, StorageError::ContainerNotFound(_)));
    }
}
