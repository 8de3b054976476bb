//! Digests used by the chunk engine
//!
//! Two digests are computed while a volume is streamed:
//! - an MD5 over each stored (compressed) chunk object, used only to
//!   address and spot-check objects
//! - a SHA-256 over every integrity block, used to detect corruption and
//!   to decide whether a region changed relative to the parent backup

use md5::Md5;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// Hex MD5 of a stored chunk object
pub fn block_digest(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// SHA-256 digest of one integrity block
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegrityDigest([u8; 32]);

impl IntegrityDigest {
    /// Compute digest from data
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&result);
        Self(digest)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidDigest(e.to_string()))?;
        let digest: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidDigest(format!("Expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(digest))
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for IntegrityDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for IntegrityDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityDigest({})", &self.to_hex()[..16])
    }
}

// Persisted as plain hex strings in the sha file.
impl Serialize for IntegrityDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IntegrityDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Split a chunk into integrity blocks and digest each one.
///
/// The last block is shorter when `data.len()` is not a multiple of
/// `block_size`.
pub fn integrity_digests(data: &[u8], block_size: usize) -> Vec<IntegrityDigest> {
    data.chunks(block_size)
        .map(IntegrityDigest::from_data)
        .collect()
}

/// Check the chunk/block size relationship used by every backup.
pub fn validate_chunking(chunk_size: usize, block_size: usize) -> Result<()> {
    if chunk_size == 0 || block_size == 0 {
        return Err(Error::InvalidChunking(format!(
            "chunk size ({}) and sha block size ({}) must be non-zero",
            chunk_size, block_size
        )));
    }
    if chunk_size % block_size != 0 {
        return Err(Error::BlockSizeMismatch {
            chunk_size,
            block_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_digest_known_value() {
        assert_eq!(block_digest(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(block_digest(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_integrity_digest_hex() {
        let digest = IntegrityDigest::from_data(b"abc");
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let parsed = IntegrityDigest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(digest, parsed);
        assert!(IntegrityDigest::from_hex("abcd").is_err());
    }

    #[test]
    fn test_integrity_digests_short_tail() {
        let data = vec![7u8; 10];
        let digests = integrity_digests(&data, 4);
        assert_eq!(digests.len(), 3);
        assert_eq!(digests[0], digests[1]);
        assert_eq!(digests[2], IntegrityDigest::from_data(&[7u8; 2]));
    }

    #[test]
    fn test_validate_chunking() {
        assert!(validate_chunking(1024, 256).is_ok());
        assert!(matches!(
            validate_chunking(1000, 256),
            Err(Error::BlockSizeMismatch { .. })
        ));
        assert!(matches!(
            validate_chunking(1024, 0),
            Err(Error::InvalidChunking(_))
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let digest = IntegrityDigest::from_data(b"block");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));
        let back: IntegrityDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
