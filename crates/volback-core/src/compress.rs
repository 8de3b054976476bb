//! Chunk compression
//!
//! Compression is applied to whole chunks before upload. The algorithm
//! used for an object is recorded next to it in the object index, so a
//! restore never depends on the currently configured default.

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default zstd compression level
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Supported chunk compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Store chunks as-is
    None,
    /// DEFLATE with a zlib header
    #[default]
    Zlib,
    /// Burrows-Wheeler (bzip2)
    Bz2,
    /// Zstandard
    Zstd,
}

impl Compression {
    /// Select a compressor by its configuration name.
    ///
    /// Names are case-insensitive. `none`, `off` and `no` select the
    /// identity compressor; unknown names are a configuration error.
    pub fn select(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "no" => Ok(Compression::None),
            "zlib" | "gzip" => Ok(Compression::Zlib),
            "bz2" | "bzip2" => Ok(Compression::Bz2),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(Error::UnknownCompressor(name.to_string())),
        }
    }

    /// Name recorded in an object record (`None` for uncompressed objects)
    pub fn record_name(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Zlib => Some("zlib"),
            Compression::Bz2 => Some("bz2"),
            Compression::Zstd => Some("zstd"),
        }
    }

    /// Resolve the algorithm recorded for an object
    pub fn from_record(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(Compression::None),
            Some(name) => Self::select(name),
        }
    }

    /// Compress a chunk
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| Error::Compression(format!("zlib: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(format!("zlib: {}", e)))
            }
            Compression::Bz2 => {
                let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| Error::Compression(format!("bz2: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(format!("bz2: {}", e)))
            }
            Compression::Zstd => zstd::stream::encode_all(data, DEFAULT_ZSTD_LEVEL)
                .map_err(|e| Error::Compression(format!("zstd: {}", e))),
        }
    }

    /// Decompress a stored object
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        match self {
            Compression::None => return Ok(data.to_vec()),
            Compression::Zlib => {
                ZlibDecoder::new(data)
                    .read_to_end(&mut output)
                    .map_err(|e| Error::Decompression(format!("zlib: {}", e)))?;
            }
            Compression::Bz2 => {
                BzDecoder::new(data)
                    .read_to_end(&mut output)
                    .map_err(|e| Error::Decompression(format!("bz2: {}", e)))?;
            }
            Compression::Zstd => {
                output = zstd::stream::decode_all(data)
                    .map_err(|e| Error::Decompression(format!("zstd: {}", e)))?;
            }
        }
        Ok(output)
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::select(s)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record_name().unwrap_or("none"))
    }
}
