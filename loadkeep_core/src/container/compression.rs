//! Per-chunk compression methods.

use crate::error::{Error, Result};
use serde::Deserialize;

/// Compression applied to a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Stored as-is.
    Copy = 0,
    /// Zstandard.
    Zstd = 1,
    /// LZ4 block format (no size prefix).
    Lz4 = 2,
}

impl CompressionMethod {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionMethod::Copy),
            1 => Ok(CompressionMethod::Zstd),
            2 => Ok(CompressionMethod::Lz4),
            _ => Err(Error::compression(format!(
                "Invalid compression method: {}",
                value
            ))),
        }
    }

    /// Get the string name of this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::Copy => "copy",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::Lz4 => "lz4",
        }
    }
}

/// Compress one chunk with `method`, falling back to `Copy` when it doesn't shrink.
pub fn compress_chunk(
    method: CompressionMethod,
    level: i32,
    data: &[u8],
) -> Result<(CompressionMethod, Vec<u8>)> {
    let compressed = match method {
        CompressionMethod::Copy => return Ok((CompressionMethod::Copy, data.to_vec())),
        CompressionMethod::Zstd => compress_zstd(data, level)?,
        CompressionMethod::Lz4 => lz4_flex::block::compress(data),
    };
    if compressed.len() >= data.len() {
        Ok((CompressionMethod::Copy, data.to_vec()))
    } else {
        Ok((method, compressed))
    }
}

/// Decompress a chunk into `out`, which must be exactly the decompressed length.
pub fn decompress_chunk_into(method: CompressionMethod, data: &[u8], out: &mut [u8]) -> Result<()> {
    let written = match method {
        CompressionMethod::Copy => {
            if data.len() != out.len() {
                return Err(Error::compression(format!(
                    "stored chunk is {} bytes, expected {}",
                    data.len(),
                    out.len()
                )));
            }
            out.copy_from_slice(data);
            data.len()
        }
        CompressionMethod::Zstd => zstd::bulk::decompress_to_buffer(data, out)
            .map_err(|e| Error::compression(format!("zstd decompression failed: {}", e)))?,
        CompressionMethod::Lz4 => lz4_flex::block::decompress_into(data, out)
            .map_err(|e| Error::compression(format!("lz4 decompression failed: {}", e)))?,
    };
    if written != out.len() {
        return Err(Error::compression(format!(
            "chunk decompressed to {} bytes, expected {}",
            written,
            out.len()
        )));
    }
    Ok(())
}

/// Compress data using zstd.
fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, level)
        .map_err(|e| Error::compression(format!("zstd compression failed: {}", e)))
}

/// Compress a whole payload with zstd (loose objects).
pub fn compress_zstd_all(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::encode_all(data, level)
        .map_err(|e| Error::compression(format!("zstd compression failed: {}", e)))
}

/// Decompress a whole zstd payload (loose objects).
pub fn decompress_zstd_all(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| Error::compression(format!("zstd decompression failed: {}", e)))
}
