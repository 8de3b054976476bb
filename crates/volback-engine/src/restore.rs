//! Restore engine
//!
//! Streams a backup's chunk objects back into a destination volume. Objects
//! are fetched ahead of the write position but written strictly in index
//! order, each at its recorded offset.

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use volback_core::{
    block_digest, index, Compression, IntegrityDigest, MetadataDocument, ObjectEntry,
    ObjectRecord, ShaFile,
};
use volback_storage::ObjectStore;

use crate::error::{EngineError, EngineResult, Phase, ResultExt};
use crate::notify::ProgressTracker;

/// Result of a restore run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub bytes_written: u64,
    pub objects_fetched: u64,
    /// Objects superseded by a later object at the same offset
    pub objects_skipped: u64,
}

/// Writes chunk objects back into a volume stream
pub struct RestoreEngine {
    store: Arc<dyn ObjectStore>,
    container: String,
    prefetch: usize,
}

impl RestoreEngine {
    pub fn new(store: Arc<dyn ObjectStore>, container: &str, prefetch: usize) -> Self {
        Self {
            store,
            container: container.to_string(),
            prefetch: prefetch.max(1),
        }
    }

    /// Restore every live object of `document` into `writer`.
    ///
    /// With a sha file, each restored integrity block is checked against
    /// the digest recorded at its block index.
    pub async fn run<W>(
        &self,
        document: &MetadataDocument,
        sha_file: Option<&ShaFile>,
        writer: &mut W,
        progress: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> EngineResult<RestoreOutcome>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send,
    {
        let verify = match sha_file {
            Some(file) if file.chunk_size == 0 => {
                return Err(EngineError::InvalidBackup(
                    "sha file records a zero block size".into(),
                ))
            }
            Some(file) => Some((file.chunk_size as usize, file.sha256s.as_slice())),
            None => None,
        };

        let entries: Vec<ObjectEntry> = index::live_entries(&document.objects)
            .into_iter()
            .cloned()
            .collect();
        let objects_skipped = (document.objects.len() - entries.len()) as u64;
        if objects_skipped > 0 {
            debug!(objects_skipped, "Skipping superseded objects");
        }

        let mut fetched = stream::iter(entries)
            .map(|entry| {
                let store = self.store.clone();
                let container = self.container.clone();
                let expected = verify.map(|(block_size, digests)| {
                    expected_digests(&entry.record, block_size, digests)
                        .map(|expected| (block_size, expected))
                });
                async move {
                    let expected = expected.transpose()?;
                    fetch_object(store.as_ref(), &container, entry, expected).await
                }
            })
            .buffered(self.prefetch);

        let mut outcome = RestoreOutcome {
            bytes_written: 0,
            objects_fetched: 0,
            objects_skipped,
        };

        while let Some(result) = fetched.next().await {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let (entry, data) = result.in_phase(Phase::RestoreFetch)?;

            writer
                .seek(SeekFrom::Start(entry.record.offset))
                .await
                .in_phase(Phase::RestoreApply)?;
            writer.write_all(&data).await.in_phase(Phase::RestoreApply)?;

            outcome.objects_fetched += 1;
            outcome.bytes_written += data.len() as u64;
            progress.advance(data.len() as u64);
        }

        writer.flush().await.in_phase(Phase::RestoreApply)?;
        Ok(outcome)
    }
}

/// Digests the sha file records for the blocks an object covers
fn expected_digests(
    record: &ObjectRecord,
    block_size: usize,
    digests: &[IntegrityDigest],
) -> EngineResult<Vec<IntegrityDigest>> {
    if record.offset % block_size as u64 != 0 {
        return Err(EngineError::Corruption(format!(
            "object at offset {} is not aligned to {}-byte blocks",
            record.offset, block_size
        )));
    }
    let first = (record.offset / block_size as u64) as usize;
    let count = (record.length as usize).div_ceil(block_size);
    digests
        .get(first..first + count)
        .map(<[IntegrityDigest]>::to_vec)
        .ok_or_else(|| {
            EngineError::Corruption(format!(
                "sha file has {} digests, object needs blocks {}..{}",
                digests.len(),
                first,
                first + count
            ))
        })
}

async fn fetch_object(
    store: &dyn ObjectStore,
    container: &str,
    entry: ObjectEntry,
    expected: Option<(usize, Vec<IntegrityDigest>)>,
) -> EngineResult<(ObjectEntry, Bytes)> {
    let stored = store.get(container, &entry.name).await?;

    let name = entry.name.clone();
    let record = entry.record.clone();
    let data =
        tokio::task::spawn_blocking(move || decode_object(&name, &record, &stored, expected))
            .await??;

    Ok((entry, Bytes::from(data)))
}

/// Check and decompress one stored object
fn decode_object(
    name: &str,
    record: &ObjectRecord,
    stored: &[u8],
    expected: Option<(usize, Vec<IntegrityDigest>)>,
) -> EngineResult<Vec<u8>> {
    let md5 = block_digest(stored);
    if md5 != record.md5 {
        return Err(EngineError::Corruption(format!(
            "{}: md5 {} does not match recorded {}",
            name, md5, record.md5
        )));
    }

    let compression = Compression::from_record(record.compression.as_deref())?;
    let data = compression.decompress(stored)?;
    if data.len() as u64 != record.length {
        return Err(EngineError::Corruption(format!(
            "{}: decompressed to {} bytes, expected {}",
            name,
            data.len(),
            record.length
        )));
    }

    if let Some((block_size, digests)) = expected {
        for (i, (block, digest)) in data.chunks(block_size).zip(&digests).enumerate() {
            if IntegrityDigest::from_data(block) != *digest {
                return Err(EngineError::Corruption(format!(
                    "{}: integrity block {} does not match its sha256",
                    name, i
                )));
            }
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkEngine, ChunkSettings};
    use crate::notify::{CollectingProgress, Operation};
    use std::io::Cursor;
    use volback_core::{DocumentHeader, ObjectNaming};
    use volback_storage::MemoryBackend;

    fn tracker(total: u64) -> ProgressTracker {
        ProgressTracker::new(
            Arc::new(CollectingProgress::new()),
            Operation::Restore,
            "b",
            "v",
            total,
            1,
        )
    }

    async fn backed_up(data: &[u8]) -> (Arc<MemoryBackend>, MetadataDocument, ShaFile) {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_container("c").await.unwrap();
        let settings = ChunkSettings {
            chunk_size: 16,
            block_size: 4,
            compression: Compression::Bz2,
            max_inflight: 1,
        };
        let engine = ChunkEngine::new(backend.clone(), "c", ObjectNaming::new("p"), settings);
        let mut reader = data;
        let outcome = engine
            .run(&mut reader, None, &mut tracker(0), &CancellationToken::new())
            .await
            .unwrap();

        let header = DocumentHeader {
            backup_id: "b".into(),
            volume_id: "v".into(),
            ..Default::default()
        };
        let document = MetadataDocument::from_index(&header, None, 16, &outcome.index);
        let sha_file = ShaFile::from_index(&header, 4, &outcome.shas);
        (backend, document, sha_file)
    }

    #[tokio::test]
    async fn test_restore_roundtrip() {
        let data: Vec<u8> = (0..50u8).collect();
        let (backend, document, sha_file) = backed_up(&data).await;

        let engine = RestoreEngine::new(backend, "c", 3);
        let mut dest = Cursor::new(Vec::new());
        let outcome = engine
            .run(
                &document,
                Some(&sha_file),
                &mut dest,
                &mut tracker(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(dest.into_inner(), data);
        assert_eq!(outcome.objects_fetched, 4);
        assert_eq!(outcome.bytes_written, 50);
    }

    #[tokio::test]
    async fn test_tampered_object_is_corruption() {
        let data = vec![3u8; 32];
        let (backend, document, sha_file) = backed_up(&data).await;
        backend.tamper("c", "p-00002", Bytes::from("garbage")).await;

        let engine = RestoreEngine::new(backend, "c", 1);
        let mut dest = Cursor::new(Vec::new());
        let err = engine
            .run(
                &document,
                Some(&sha_file),
                &mut dest,
                &mut tracker(32),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Some(Phase::RestoreFetch));
        assert!(matches!(err.root(), EngineError::Corruption(_)));
    }

    #[test]
    fn test_block_digest_mismatch_detected() {
        let payload = b"abcdefgh".to_vec();
        let record = ObjectRecord {
            md5: block_digest(&payload),
            offset: 0,
            length: 8,
            compression: None,
        };
        let good = vec![
            IntegrityDigest::from_data(b"abcd"),
            IntegrityDigest::from_data(b"efgh"),
        ];
        assert_eq!(
            decode_object("o", &record, &payload, Some((4, good))).unwrap(),
            payload
        );

        let bad = vec![
            IntegrityDigest::from_data(b"abcd"),
            IntegrityDigest::from_data(b"zzzz"),
        ];
        let err = decode_object("o", &record, &payload, Some((4, bad))).unwrap_err();
        assert!(matches!(err, EngineError::Corruption(m) if m.contains("block 1")));
    }

    #[test]
    fn test_expected_digests_bounds() {
        let digests = vec![IntegrityDigest::from_data(b"x"); 3];
        let record = ObjectRecord {
            md5: String::new(),
            offset: 4,
            length: 6,
            compression: None,
        };
        assert_eq!(expected_digests(&record, 4, &digests).unwrap().len(), 2);

        let beyond = ObjectRecord {
            length: 12,
            ..record
        };
        assert!(expected_digests(&beyond, 4, &digests).is_err());
    }
}
