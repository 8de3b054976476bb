//! Core data structures for chunked volume backups
//!
//! This crate holds the pure pieces of the backup engine: digests,
//! compression, object naming, the object/sha indexes and the versioned
//! metadata documents persisted next to every backup.

pub mod compress;
pub mod digest;
pub mod error;
pub mod index;
pub mod metadata;
pub mod naming;
pub mod volume_meta;

pub use compress::Compression;
pub use digest::{block_digest, integrity_digests, validate_chunking, IntegrityDigest};
pub use error::{Error, Result};
pub use index::{ObjectEntry, ObjectIndex, ObjectRecord, ShaIndex};
pub use metadata::{DocumentHeader, MetadataDocument, MetadataVersion, ShaFile, METADATA_VERSION};
pub use naming::{ObjectNaming, PrefixSeed};
pub use volume_meta::{
    VolumeMetaSnapshot, BASE_SECTION, EXTENDED_SECTION, GLANCE_SECTION, VOLUME_META_VERSION,
};

/// Default size of a chunk object (50 MiB)
pub const CHUNK_SIZE_DEFAULT: usize = 50 * 1024 * 1024;

/// Default size of an integrity block (32 KiB)
pub const SHA_BLOCK_SIZE_DEFAULT: usize = 32 * 1024;
