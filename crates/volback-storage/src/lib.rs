//! Object-store backends for volback
//!
//! This crate provides the object-store contract the backup engine writes
//! chunk objects through, the backends implementing it, and the codec
//! that persists backup metadata documents.

pub mod backend;
pub mod codec;
pub mod error;
pub mod local;
pub mod memory;
pub mod s3;

pub use backend::ObjectStore;
pub use codec::MetadataCodec;
pub use error::{StorageError, StorageResult};
pub use local::LocalBackend;
pub use memory::{MemoryBackend, OpCounts};
pub use s3::{S3Backend, S3Config};
