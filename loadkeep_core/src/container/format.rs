//! Binary container layout.
//!
//! All integers are little-endian.
//!
//! ```text
//! Header (40 bytes)
//! 0x00  4   "LKCT" magic
//! 0x04  1   version (u8) = 1
//! 0x05  3   reserved (must be 0)
//! 0x08  4   chunk_size (u32)
//! 0x0C  4   chunk_count (u32)
//! 0x10  4   entry_count (u32)
//! 0x14  4   crc32 of chunk table + entry table
//! 0x18  8   total decompressed stream size (u64)
//! 0x20  8   data section offset (u64)
//!
//! Chunk record (24 bytes, chunk_count times)
//! 0x00  1   method: 0=copy, 1=zstd, 2=lz4
//! 0x01  3   reserved
//! 0x04  4   compressed_size (u32)
//! 0x08  8   offset relative to the data section (u64)
//! 0x10  4   crc32 of the compressed bytes
//! 0x14  4   reserved
//!
//! Entry record (48 bytes, entry_count times)
//! 0x00  32  BLAKE3 content hash
//! 0x20  8   size (u64)
//! 0x28  4   first_chunk (u32)
//! 0x2C  4   intra_offset (u32)
//!
//! Data section: compressed chunks back to back
//! ```
//!
//! The decompressed stream is every entry concatenated. Each chunk covers
//! exactly `chunk_size` bytes of it except the last one.

use super::compression::CompressionMethod;
use crate::error::{Error, Result};
use crate::hash::{ContentHash, HASH_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

/// Magic bytes at the start of every container file.
pub const MAGIC: &[u8; 4] = b"LKCT";

/// Current container format version.
pub const VERSION: u8 = 1;

/// Size of the container header in bytes.
pub const HEADER_SIZE: usize = 40;

/// Size of one chunk table record.
pub const CHUNK_RECORD_SIZE: usize = 24;

/// Size of one entry table record.
pub const ENTRY_RECORD_SIZE: usize = 48;

/// File extension of finished containers.
pub const CONTAINER_EXTENSION: &str = "lkc";

/// File extension used while a container is being packed.
pub const TEMP_EXTENSION: &str = "tmp";

/// Fixed-size container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub entry_count: u32,
    pub table_crc: u32,
    pub total_size: u64,
    pub data_offset: u64,
}

impl ContainerHeader {
    /// Offset where the data section must start for the given table sizes.
    pub fn data_offset_for(chunk_count: u32, entry_count: u32) -> u64 {
        (HEADER_SIZE
            + chunk_count as usize * CHUNK_RECORD_SIZE
            + entry_count as usize * ENTRY_RECORD_SIZE) as u64
    }

    /// Encode the header to a 40-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        // 5..8 reserved
        LittleEndian::write_u32(&mut buf[8..12], self.chunk_size);
        LittleEndian::write_u32(&mut buf[12..16], self.chunk_count);
        LittleEndian::write_u32(&mut buf[16..20], self.entry_count);
        LittleEndian::write_u32(&mut buf[20..24], self.table_crc);
        LittleEndian::write_u64(&mut buf[24..32], self.total_size);
        LittleEndian::write_u64(&mut buf[32..40], self.data_offset);
        buf
    }

    /// Decode and sanity-check a header.
    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted_container(
                path,
                format!(
                    "Header too short: {} bytes (expected {})",
                    buf.len(),
                    HEADER_SIZE
                ),
            ));
        }

        // Check magic
        if &buf[0..4] != MAGIC {
            return Err(Error::corrupted_container(
                path,
                format!("Invalid magic: expected {:?}, got {:?}", MAGIC, &buf[0..4]),
            ));
        }

        if buf[4] != VERSION {
            return Err(Error::corrupted_container(
                path,
                format!("Unsupported version: {} (expected {})", buf[4], VERSION),
            ));
        }

        if buf[5..8] != [0, 0, 0] {
            return Err(Error::corrupted_container(path, "Reserved header bytes must be 0"));
        }

        let header = Self {
            chunk_size: LittleEndian::read_u32(&buf[8..12]),
            chunk_count: LittleEndian::read_u32(&buf[12..16]),
            entry_count: LittleEndian::read_u32(&buf[16..20]),
            table_crc: LittleEndian::read_u32(&buf[20..24]),
            total_size: LittleEndian::read_u64(&buf[24..32]),
            data_offset: LittleEndian::read_u64(&buf[32..40]),
        };

        if header.chunk_size == 0 {
            return Err(Error::corrupted_container(path, "chunk_size is 0"));
        }
        let expected_chunks = header.total_size.div_ceil(header.chunk_size as u64);
        if expected_chunks != header.chunk_count as u64 {
            return Err(Error::corrupted_container(
                path,
                format!(
                    "chunk_count {} does not cover {} bytes at chunk size {}",
                    header.chunk_count, header.total_size, header.chunk_size
                ),
            ));
        }
        if header.data_offset != Self::data_offset_for(header.chunk_count, header.entry_count) {
            return Err(Error::corrupted_container(
                path,
                format!("Unexpected data offset: {}", header.data_offset),
            ));
        }
        Ok(header)
    }

    /// Decompressed length of chunk `index`; the last chunk may be short.
    pub fn chunk_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        let remaining = self.total_size.saturating_sub(start);
        remaining.min(self.chunk_size as u64) as usize
    }
}

/// Location and encoding of one compressed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub method: CompressionMethod,
    pub compressed_size: u32,
    pub offset: u64,
    pub crc32: u32,
}

impl ChunkRecord {
    pub fn encode(&self) -> [u8; CHUNK_RECORD_SIZE] {
        let mut buf = [0u8; CHUNK_RECORD_SIZE];
        buf[0] = self.method.to_u8();
        LittleEndian::write_u32(&mut buf[4..8], self.compressed_size);
        LittleEndian::write_u64(&mut buf[8..16], self.offset);
        LittleEndian::write_u32(&mut buf[16..20], self.crc32);
        buf
    }

    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < CHUNK_RECORD_SIZE {
            return Err(Error::corrupted_container(path, "Truncated chunk record"));
        }
        let method = CompressionMethod::from_u8(buf[0])
            .map_err(|e| Error::corrupted_container(path, e.to_string()))?;
        Ok(Self {
            method,
            compressed_size: LittleEndian::read_u32(&buf[4..8]),
            offset: LittleEndian::read_u64(&buf[8..16]),
            crc32: LittleEndian::read_u32(&buf[16..20]),
        })
    }
}

/// One packed file: the raw per-entry header stored in the content index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
    pub hash: ContentHash,
    pub size: u64,
    pub first_chunk: u32,
    pub intra_offset: u32,
}

impl EntryRecord {
    pub fn encode(&self) -> [u8; ENTRY_RECORD_SIZE] {
        let mut buf = [0u8; ENTRY_RECORD_SIZE];
        buf[0..HASH_SIZE].copy_from_slice(self.hash.as_bytes());
        LittleEndian::write_u64(&mut buf[32..40], self.size);
        LittleEndian::write_u32(&mut buf[40..44], self.first_chunk);
        LittleEndian::write_u32(&mut buf[44..48], self.intra_offset);
        buf
    }

    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() != ENTRY_RECORD_SIZE {
            return Err(Error::corrupted_container(
                path,
                format!("Entry record is {} bytes (expected {})", buf.len(), ENTRY_RECORD_SIZE),
            ));
        }
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&buf[0..HASH_SIZE]);
        Ok(Self {
            hash: ContentHash::from_bytes(hash),
            size: LittleEndian::read_u64(&buf[32..40]),
            first_chunk: LittleEndian::read_u32(&buf[40..44]),
            intra_offset: LittleEndian::read_u32(&buf[44..48]),
        })
    }

    /// Offset of the entry's first byte in the decompressed stream.
    pub fn stream_offset(&self, chunk_size: u32) -> u64 {
        self.first_chunk as u64 * chunk_size as u64 + self.intra_offset as u64
    }

    /// Hex form of the encoded record, as kept in the content index.
    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn from_hex(s: &str, path: &Path) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::corrupted_container(path, format!("Invalid entry hex: {}", e)))?;
        Self::decode(&bytes, path)
    }
}
