//! Content hashing using BLAKE3.

use crate::error::{Error, Result};
use crate::throttle::CancellationToken;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Digest size in bytes (BLAKE3 produces 256-bit hashes).
pub const HASH_SIZE: usize = 32;

/// Read buffer used when hashing streams; cancellation is checked per buffer.
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Identifies file content by value. Equal bytes always produce equal hashes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; HASH_SIZE]);

impl ContentHash {
    /// Create a hash from raw digest bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        ContentHash(bytes)
    }

    /// Create a hash from a hex string (64 hex characters).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != HASH_SIZE * 2 {
            return Err(Error::invalid_hash(format!(
                "Expected {} hex characters, got {}",
                HASH_SIZE * 2,
                hex_str.len()
            )));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::invalid_hash(format!("Invalid hex: {}", e)))?;

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes);
        Ok(ContentHash(hash))
    }

    /// Convert to hex string (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// First 2 hex characters (shard directory of the loose store).
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Remaining 62 hex characters (file name in the loose store).
    pub fn suffix(&self) -> String {
        hex::encode(&self.0[1..])
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Hash raw bytes.
    pub fn hash_bytes(data: &[u8]) -> Self {
        ContentHash(*blake3::hash(data).as_bytes())
    }

    /// Hash everything a reader yields.
    pub fn hash_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(ContentHash(*hasher.finalize().as_bytes()))
    }

    /// Hash a reader, checking `cancel` between buffers.
    ///
    /// Returns the hash and the number of bytes read.
    pub fn hash_reader_cancellable<R: Read>(
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<(Self, u64)> {
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            cancel.check()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((ContentHash(*hasher.finalize().as_bytes()), total))
    }

    /// Hash a file on disk.
    pub fn hash_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::hash_reader(file)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
