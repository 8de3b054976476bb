//! Metadata codec - persists backup metadata documents
//!
//! Reads and writes the `<prefix>_metadata` and `<prefix>_sha256file`
//! objects of a backup through any object store.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};
use volback_core::{MetadataDocument, ObjectNaming, ShaFile};

use crate::backend::ObjectStore;
use crate::error::{StorageError, StorageResult};

/// Codec for backup metadata and sha files
#[derive(Clone)]
pub struct MetadataCodec {
    backend: Arc<dyn ObjectStore>,
}

impl MetadataCodec {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self { backend }
    }

    /// Write the metadata object
    #[instrument(skip(self, naming, document), fields(prefix = %naming.prefix(), objects = document.objects.len()))]
    pub async fn write_metadata(
        &self,
        container: &str,
        naming: &ObjectNaming,
        document: &MetadataDocument,
    ) -> StorageResult<()> {
        let json = document.to_json()?;
        self.backend
            .put(
                container,
                &naming.metadata_object_name(),
                Bytes::from(json),
                document.extra_metadata.as_deref(),
            )
            .await
    }

    /// Write the sha file
    #[instrument(skip(self, naming, file), fields(prefix = %naming.prefix(), blocks = file.sha256s.len()))]
    pub async fn write_sha_file(
        &self,
        container: &str,
        naming: &ObjectNaming,
        file: &ShaFile,
    ) -> StorageResult<()> {
        let json = file.to_json()?;
        self.backend
            .put(container, &naming.sha_object_name(), Bytes::from(json), None)
            .await
    }

    /// Read the metadata object
    #[instrument(skip(self, naming), fields(prefix = %naming.prefix()))]
    pub async fn read_metadata(
        &self,
        container: &str,
        naming: &ObjectNaming,
    ) -> StorageResult<MetadataDocument> {
        let name = naming.metadata_object_name();
        let data = self.read_document(container, &name).await?;
        Ok(MetadataDocument::from_json(&data)?)
    }

    /// Read the sha file
    #[instrument(skip(self, naming), fields(prefix = %naming.prefix()))]
    pub async fn read_sha_file(
        &self,
        container: &str,
        naming: &ObjectNaming,
    ) -> StorageResult<ShaFile> {
        let name = naming.sha_object_name();
        let data = self.read_document(container, &name).await?;
        Ok(ShaFile::from_json(&data)?)
    }

    pub async fn delete_metadata(&self, container: &str, naming: &ObjectNaming) -> StorageResult<()> {
        self.backend
            .delete(container, &naming.metadata_object_name())
            .await
    }

    pub async fn delete_sha_file(&self, container: &str, naming: &ObjectNaming) -> StorageResult<()> {
        self.backend.delete(container, &naming.sha_object_name()).await
    }

    async fn read_document(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        match self.backend.get(container, name).await {
            Ok(data) => Ok(data),
            Err(StorageError::NotFound { .. }) => {
                debug!(name, "Backup document missing");
                Err(StorageError::MetadataNotFound {
                    container: container.to_string(),
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use volback_core::{DocumentHeader, IntegrityDigest, ObjectIndex, ObjectRecord, ShaIndex};

    fn header() -> DocumentHeader {
        DocumentHeader {
            backup_id: "b1".into(),
            volume_id: "v1".into(),
            backup_name: None,
            backup_description: Some("weekly".into()),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_documents() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_container("c").await.unwrap();
        let codec = MetadataCodec::new(backend.clone());
        let naming = ObjectNaming::new("vol/b1");

        let mut index = ObjectIndex::new(naming.prefix());
        index.push(
            naming.chunk_object_name(1),
            ObjectRecord {
                md5: "ab".repeat(16),
                offset: 0,
                length: 8,
                compression: None,
            },
        );
        let doc = MetadataDocument::from_index(&header(), None, 8, &index);
        codec.write_metadata("c", &naming, &doc).await.unwrap();

        let mut shas = ShaIndex::new(naming.prefix());
        shas.extend(&[IntegrityDigest::from_data(b"12345678")]);
        let sha_file = ShaFile::from_index(&header(), 8, &shas);
        codec.write_sha_file("c", &naming, &sha_file).await.unwrap();

        assert_eq!(codec.read_metadata("c", &naming).await.unwrap(), doc);
        assert_eq!(codec.read_sha_file("c", &naming).await.unwrap(), sha_file);
        assert_eq!(
            backend.object_names("c").await,
            vec!["vol/b1_metadata", "vol/b1_sha256file"]
        );
    }

    #[tokio::test]
    async fn test_missing_documents_are_distinct() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_container("c").await.unwrap();
        let codec = MetadataCodec::new(backend);
        let naming = ObjectNaming::new("vol/never-finished");

        let err = codec.read_metadata("c", &naming).await.unwrap_err();
        assert!(matches!(err, StorageError::MetadataNotFound { .. }));
        let err = codec.read_sha_file("c", &naming).await.unwrap_err();
        assert!(matches!(err, StorageError::MetadataNotFound { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_core_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_container("c").await.unwrap();
        let naming = ObjectNaming::new("p");
        backend
            .put("c", &naming.metadata_object_name(), Bytes::from("{not json"), None)
            .await
            .unwrap();

        let codec = MetadataCodec::new(backend);
        let err = codec.read_metadata("c", &naming).await.unwrap_err();
        assert!(matches!(err, StorageError::Core(_)));
    }
}
