//! Error types for volback-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown compression algorithm: {0}")]
    UnknownCompressor(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Chunk size {chunk_size} is not a multiple of sha block size {block_size}")]
    BlockSizeMismatch { chunk_size: usize, block_size: usize },

    #[error("Invalid chunking parameters: {0}")]
    InvalidChunking(String),

    #[error("Unsupported metadata version: {0}")]
    UnsupportedVersion(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
