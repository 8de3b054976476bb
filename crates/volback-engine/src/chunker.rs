//! Chunk engine
//!
//! Reads a volume stream `chunk_size` bytes at a time, digests every
//! integrity block of each chunk and uploads the chunks that differ from
//! the parent backup. Only one chunk buffer per in-flight upload is live
//! at any time.
//!
//! A chunk is reused from the parent when:
//! - the parent has an object at the same offset with the same length
//! - every integrity digest matches the parent's at the same block index
//! - for a short (final) chunk, the parent stream ends where this one does

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use volback_core::{
    block_digest, index, integrity_digests, Compression, IntegrityDigest, ObjectEntry,
    ObjectIndex, ObjectNaming, ObjectRecord, ShaIndex,
};
use volback_storage::ObjectStore;

use crate::error::{EngineError, EngineResult};
use crate::notify::ProgressTracker;

/// Chunking parameters of one backup run
#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub chunk_size: usize,
    pub block_size: usize,
    pub compression: Compression,
    pub max_inflight: usize,
}

/// Read-only view of the parent backup an incremental compares against
#[derive(Debug, Clone, Default)]
pub struct ParentState {
    /// Flattened object list of the parent
    pub objects: Vec<ObjectEntry>,
    /// Integrity digests of the parent stream
    pub sha256s: Vec<IntegrityDigest>,
}

impl ParentState {
    /// Length of the object that restores each offset of the parent
    fn chunk_lengths(&self) -> HashMap<u64, u64> {
        index::live_entries(&self.objects)
            .into_iter()
            .map(|entry| (entry.record.offset, entry.record.length))
            .collect()
    }
}

/// Result of a chunking run
#[derive(Debug)]
pub struct ChunkOutcome {
    /// Object index: inherited entries first, then new ones in read order
    pub index: ObjectIndex,
    /// Digests of this stream
    pub shas: ShaIndex,
    /// Chunk objects uploaded by this run
    pub objects_written: u64,
    /// Chunks served by parent objects
    pub chunks_reused: u64,
    /// Bytes read from the volume stream
    pub bytes_read: u64,
}

type UploadResult = EngineResult<(u64, String, ObjectRecord)>;

/// Splits a volume stream into chunk objects
pub struct ChunkEngine {
    store: Arc<dyn ObjectStore>,
    container: String,
    naming: ObjectNaming,
    settings: ChunkSettings,
    extra_metadata: Option<String>,
}

impl ChunkEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        container: &str,
        naming: ObjectNaming,
        settings: ChunkSettings,
    ) -> Self {
        Self {
            store,
            container: container.to_string(),
            naming,
            settings,
            extra_metadata: None,
        }
    }

    /// Backend string attached to every object and the index
    pub fn with_extra_metadata(mut self, extra: Option<String>) -> Self {
        self.extra_metadata = extra;
        self
    }

    /// Chunk the whole stream.
    ///
    /// Object names are allocated in read order before their upload
    /// starts. Any failed upload aborts the run.
    pub async fn run<R>(
        &self,
        reader: &mut R,
        parent: Option<&ParentState>,
        progress: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> EngineResult<ChunkOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let prefix = self.naming.prefix();
        let mut index = match parent {
            Some(parent) => ObjectIndex::inherit(prefix, &parent.objects),
            None => ObjectIndex::new(prefix),
        };
        index.extra_metadata = self.extra_metadata.clone();
        let mut shas = ShaIndex::new(prefix);

        let parent_lengths = parent.map(ParentState::chunk_lengths).unwrap_or_default();
        let max_inflight = self.settings.max_inflight.max(1);
        let mut uploads: JoinSet<UploadResult> = JoinSet::new();
        let mut written: BTreeMap<u64, (String, ObjectRecord)> = BTreeMap::new();
        let mut offset: u64 = 0;
        let mut chunks_reused: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                uploads.abort_all();
                info!(offset, "Backup cancelled before end of stream");
                return Err(EngineError::Cancelled);
            }

            let mut buf = vec![0u8; self.settings.chunk_size];
            let len = read_chunk(reader, &mut buf).await?;
            if len == 0 {
                break;
            }
            buf.truncate(len);
            let data = Bytes::from(buf);

            let block_size = self.settings.block_size;
            let digests = {
                let data = data.clone();
                tokio::task::spawn_blocking(move || integrity_digests(&data, block_size)).await?
            };

            let first_block = shas.block_count();
            let unchanged = parent.is_some_and(|parent| {
                self.is_unchanged(parent, &parent_lengths, offset, len, first_block, &digests)
            });

            if unchanged {
                chunks_reused += 1;
                debug!(offset, len, "Chunk unchanged, reusing parent object");
            } else {
                while uploads.len() >= max_inflight {
                    if let Some(joined) = uploads.join_next().await {
                        let (seq, name, record) = joined??;
                        written.insert(seq, (name, record));
                    }
                }

                let seq = index.allocate();
                uploads.spawn(upload_chunk(
                    self.store.clone(),
                    self.container.clone(),
                    seq,
                    self.naming.chunk_object_name(seq),
                    data,
                    offset,
                    self.settings.compression,
                    self.extra_metadata.clone(),
                ));
            }

            shas.extend(&digests);
            offset += len as u64;
            progress.advance(len as u64);
        }

        while let Some(joined) = uploads.join_next().await {
            let (seq, name, record) = joined??;
            written.insert(seq, (name, record));
        }

        let objects_written = written.len() as u64;
        for (name, record) in written.into_values() {
            index.push(name, record);
        }

        let replaced = index.compact();
        if replaced > 0 {
            debug!(replaced, "Dropped parent objects replaced by this backup");
        }

        // Parent objects past the end of a shrunken stream restore nothing
        let dropped = index.truncate_to(offset);
        if dropped > 0 {
            debug!(dropped, "Dropped inherited objects past end of stream");
        }

        Ok(ChunkOutcome {
            index,
            shas,
            objects_written,
            chunks_reused,
            bytes_read: offset,
        })
    }

    fn is_unchanged(
        &self,
        parent: &ParentState,
        parent_lengths: &HashMap<u64, u64>,
        offset: u64,
        len: usize,
        first_block: usize,
        digests: &[IntegrityDigest],
    ) -> bool {
        if parent_lengths.get(&offset) != Some(&(len as u64)) {
            return false;
        }
        let last_block = first_block + digests.len();
        if len < self.settings.chunk_size && parent.sha256s.len() != last_block {
            return false;
        }
        parent.sha256s.get(first_block..last_block) == Some(digests)
    }
}

/// Fill `buf` from the reader; short only at end of stream
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[allow(clippy::too_many_arguments)]
async fn upload_chunk(
    store: Arc<dyn ObjectStore>,
    container: String,
    seq: u64,
    name: String,
    data: Bytes,
    offset: u64,
    compression: Compression,
    extra_metadata: Option<String>,
) -> UploadResult {
    let length = data.len() as u64;
    let (payload, md5) = tokio::task::spawn_blocking(move || -> EngineResult<(Vec<u8>, String)> {
        let payload = compression.compress(&data)?;
        let md5 = block_digest(&payload);
        Ok((payload, md5))
    })
    .await??;

    debug!(name = %name, offset, length, stored = payload.len(), "Writing chunk object");
    store
        .put(&container, &name, Bytes::from(payload), extra_metadata.as_deref())
        .await?;

    Ok((
        seq,
        name,
        ObjectRecord {
            md5,
            offset,
            length,
            compression: compression.record_name().map(str::to_string),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{CollectingProgress, Operation};
    use volback_storage::MemoryBackend;

    fn settings(chunk_size: usize, block_size: usize) -> ChunkSettings {
        ChunkSettings {
            chunk_size,
            block_size,
            compression: Compression::Zlib,
            max_inflight: 2,
        }
    }

    async fn store() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_container("c").await.unwrap();
        backend
    }

    fn tracker(total: u64) -> ProgressTracker {
        ProgressTracker::new(
            Arc::new(CollectingProgress::new()),
            Operation::Backup,
            "b",
            "v",
            total,
            1,
        )
    }

    async fn chunk(
        backend: Arc<MemoryBackend>,
        prefix: &str,
        data: &[u8],
        parent: Option<&ParentState>,
    ) -> ChunkOutcome {
        let engine = ChunkEngine::new(backend, "c", ObjectNaming::new(prefix), settings(16, 4));
        let mut reader = data;
        engine
            .run(
                &mut reader,
                parent,
                &mut tracker(data.len() as u64),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_run_writes_every_chunk() {
        let backend = store().await;
        let data: Vec<u8> = (0..40u8).collect();
        let outcome = chunk(backend.clone(), "p", &data, None).await;

        assert_eq!(outcome.objects_written, 3);
        assert_eq!(outcome.bytes_read, 40);
        assert_eq!(outcome.shas.block_count(), 10);
        let names: Vec<&str> = outcome.index.list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["p-00001", "p-00002", "p-00003"]);
        let last = &outcome.index.list[2].record;
        assert_eq!((last.offset, last.length), (32, 8));
        assert_eq!(backend.object_names("c").await.len(), 3);
    }

    #[tokio::test]
    async fn test_incremental_reuses_unchanged_chunks() {
        let backend = store().await;
        let data: Vec<u8> = (0..48u8).collect();
        let full = chunk(backend.clone(), "full", &data, None).await;
        let parent = ParentState {
            objects: full.index.list.clone(),
            sha256s: full.shas.sha256s.clone(),
        };

        let mut changed = data.clone();
        changed[20] ^= 0xff;
        let incr = chunk(backend.clone(), "incr", &changed, Some(&parent)).await;

        assert_eq!(incr.objects_written, 1);
        assert_eq!(incr.chunks_reused, 2);
        assert_eq!(incr.index.list.len(), 3);
        assert_eq!(incr.index.list[2].name, "incr-00004");
        assert_eq!(incr.index.list[2].record.offset, 16);
        assert!(incr.index.list.iter().all(|e| e.name != "full-00002"));
    }

    #[tokio::test]
    async fn test_chain_listing_stays_bounded() {
        let backend = store().await;
        let mut data: Vec<u8> = (0..64u8).collect();
        let first = chunk(backend.clone(), "gen0", &data, None).await;
        let mut parent = ParentState {
            objects: first.index.list.clone(),
            sha256s: first.shas.sha256s.clone(),
        };

        for generation in 1..6 {
            data[0] = data[0].wrapping_add(1);
            let prefix = format!("gen{}", generation);
            let incr = chunk(backend.clone(), &prefix, &data, Some(&parent)).await;
            assert_eq!(incr.objects_written, 1);
            assert_eq!(incr.index.list.len(), 4);
            assert_eq!(incr.index.live_entries().len(), 4);
            parent = ParentState {
                objects: incr.index.list.clone(),
                sha256s: incr.shas.sha256s.clone(),
            };
        }
    }

    #[tokio::test]
    async fn test_short_tail_not_reused_when_parent_continues() {
        let backend = store().await;
        let data: Vec<u8> = (0..40u8).collect();
        let full = chunk(backend.clone(), "full", &data, None).await;
        let parent = ParentState {
            objects: full.index.list.clone(),
            sha256s: full.shas.sha256s.clone(),
        };

        // Same first 36 bytes: the last chunk is shorter than the parent's
        let incr = chunk(backend.clone(), "incr", &data[..36], Some(&parent)).await;
        assert_eq!(incr.objects_written, 1);
        assert_eq!(incr.chunks_reused, 2);
        let live = incr.index.live_entries();
        assert_eq!(live.last().unwrap().record.length, 4);
    }

    #[tokio::test]
    async fn test_shrunken_stream_drops_inherited_tail() {
        let backend = store().await;
        let data: Vec<u8> = (0..48u8).collect();
        let full = chunk(backend.clone(), "full", &data, None).await;
        let parent = ParentState {
            objects: full.index.list.clone(),
            sha256s: full.shas.sha256s.clone(),
        };

        let incr = chunk(backend.clone(), "incr", &data[..32], Some(&parent)).await;
        assert_eq!(incr.objects_written, 0);
        assert_eq!(incr.index.list.len(), 2);
        assert!(incr.index.list.iter().all(|e| e.record.end() <= 32));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops() {
        let backend = store().await;
        let engine = ChunkEngine::new(backend.clone(), "c", ObjectNaming::new("p"), settings(16, 4));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let data = [7u8; 64];
        let mut reader = &data[..];
        let err = engine
            .run(&mut reader, None, &mut tracker(64), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(backend.op_counts().puts, 0);
    }
}
