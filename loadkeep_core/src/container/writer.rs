//! Packing containers.

use super::compression::{CompressionMethod, compress_chunk};
use super::format::{ChunkRecord, ContainerHeader, EntryRecord, HEADER_SIZE, TEMP_EXTENSION};
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::throttle::CancellationToken;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Something that can be packed: declared hash and size plus a byte stream.
pub trait EntrySource {
    fn hash(&self) -> ContentHash;
    fn size(&self) -> u64;
    fn open(&self) -> Result<Box<dyn Read + '_>>;
}

/// Container packing parameters.
#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    pub chunk_size: u32,
    pub method: CompressionMethod,
    pub level: i32,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            method: CompressionMethod::Zstd,
            level: 3,
        }
    }
}

/// Result of a successful pack.
#[derive(Debug, Clone)]
pub struct PackedContainer {
    pub path: PathBuf,
    pub entries: Vec<EntryRecord>,
    pub chunk_count: u32,
    pub total_size: u64,
    pub file_size: u64,
}

/// Temp path a container is written to before it is renamed into place.
pub fn temp_path_for(path: &Path) -> PathBuf {
    path.with_extension(TEMP_EXTENSION)
}

/// Assign every entry its place in the decompressed stream.
///
/// Entries at least one chunk long start on a chunk boundary; the gap before
/// them is zero-filled. Smaller entries are packed densely.
fn plan_layout(sizes: &[(ContentHash, u64)], chunk_size: u32) -> (Vec<EntryRecord>, u64) {
    let cs = chunk_size as u64;
    let mut pos = 0u64;
    let mut records = Vec::with_capacity(sizes.len());
    for &(hash, size) in sizes {
        if size >= cs && pos % cs != 0 {
            pos = pos.div_ceil(cs) * cs;
        }
        records.push(EntryRecord {
            hash,
            size,
            first_chunk: (pos / cs) as u32,
            intra_offset: (pos % cs) as u32,
        });
        pos += size;
    }
    (records, pos)
}

/// Streams chunks into the data section of a container file.
struct ChunkSink<'a> {
    out: BufWriter<&'a File>,
    options: PackOptions,
    buffer: Vec<u8>,
    chunks: Vec<ChunkRecord>,
    offset: u64,
    cancel: &'a CancellationToken,
}

impl ChunkSink<'_> {
    fn remaining_space(&self) -> usize {
        self.options.chunk_size as usize - self.buffer.len()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.remaining_space() == 0 {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.cancel.check()?;
        let (method, data) = compress_chunk(self.options.method, self.options.level, &self.buffer)?;
        self.out.write_all(&data)?;
        self.chunks.push(ChunkRecord {
            method,
            compressed_size: data.len() as u32,
            offset: self.offset,
            crc32: crc32fast::hash(&data),
        });
        self.offset += data.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn zero_fill(&mut self, mut count: u64) -> Result<()> {
        while count > 0 {
            let n = count.min(self.remaining_space() as u64) as usize;
            self.buffer.resize(self.buffer.len() + n, 0);
            count -= n as u64;
            self.maybe_flush()?;
        }
        Ok(())
    }

    /// Copy exactly `size` bytes from `reader`, returning their hash.
    fn copy_entry(&mut self, reader: &mut dyn Read, size: u64, path: &Path) -> Result<ContentHash> {
        let mut hasher = blake3::Hasher::new();
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(self.remaining_space() as u64) as usize;
            let start = self.buffer.len();
            self.buffer.resize(start + n, 0);
            reader
                .read_exact(&mut self.buffer[start..])
                .map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => Error::pack(
                        path,
                        format!("source ended {} bytes before its declared size", remaining),
                    ),
                    _ => Error::from(e),
                })?;
            hasher.update(&self.buffer[start..]);
            remaining -= n as u64;
            self.maybe_flush()?;
        }

        let mut extra = [0u8; 1];
        if reader.read(&mut extra)? != 0 {
            return Err(Error::pack(path, "source is longer than its declared size"));
        }
        Ok(ContentHash::from_bytes(*hasher.finalize().as_bytes()))
    }
}

/// Writes immutable containers.
#[derive(Debug, Clone, Default)]
pub struct ContainerWriter {
    options: PackOptions,
}

impl ContainerWriter {
    pub fn new(options: PackOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// Pack `sources` into a new container at `path`.
    ///
    /// Duplicate hashes are packed once. The file is written under a `.tmp`
    /// name and renamed on success; on failure the temp file is removed and
    /// nothing appears at `path`.
    pub fn pack<S: EntrySource>(
        &self,
        path: &Path,
        sources: &[S],
        cancel: &CancellationToken,
    ) -> Result<PackedContainer> {
        let temp_path = temp_path_for(path);
        match self.pack_to(&temp_path, sources, cancel) {
            Ok(mut packed) => {
                fs::rename(&temp_path, path)?;
                packed.path = path.to_path_buf();
                tracing::debug!(
                    path = %path.display(),
                    entries = packed.entries.len(),
                    chunks = packed.chunk_count,
                    bytes = packed.total_size,
                    file_size = packed.file_size,
                    "wrote container"
                );
                Ok(packed)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                Err(err)
            }
        }
    }

    fn pack_to<S: EntrySource>(
        &self,
        temp_path: &Path,
        sources: &[S],
        cancel: &CancellationToken,
    ) -> Result<PackedContainer> {
        if self.options.chunk_size == 0 {
            return Err(Error::pack(temp_path, "chunk size must be positive"));
        }

        // Deduplicate by hash, first occurrence wins
        let mut seen = HashSet::new();
        let unique: Vec<&S> = sources.iter().filter(|s| seen.insert(s.hash())).collect();
        let sizes: Vec<(ContentHash, u64)> = unique.iter().map(|s| (s.hash(), s.size())).collect();

        let (entries, total_size) = plan_layout(&sizes, self.options.chunk_size);
        let chunk_count = u32::try_from(total_size.div_ceil(self.options.chunk_size as u64))
            .map_err(|_| Error::pack(temp_path, "too many chunks for one container"))?;
        let entry_count = u32::try_from(entries.len())
            .map_err(|_| Error::pack(temp_path, "too many entries for one container"))?;
        let data_offset = ContainerHeader::data_offset_for(chunk_count, entry_count);

        let mut file = File::create_new(temp_path)?;
        file.set_len(data_offset)?;
        file.seek(SeekFrom::Start(data_offset))?;

        let chunks = {
            let mut sink = ChunkSink {
                out: BufWriter::new(&file),
                options: self.options,
                buffer: Vec::with_capacity(self.options.chunk_size as usize),
                chunks: Vec::with_capacity(chunk_count as usize),
                offset: 0,
                cancel,
            };

            let mut pos = 0u64;
            for (source, record) in unique.iter().zip(&entries) {
                let start = record.stream_offset(self.options.chunk_size);
                sink.zero_fill(start - pos)?;
                let mut reader = source.open()?;
                let actual = sink.copy_entry(&mut reader, record.size, temp_path)?;
                if actual != record.hash {
                    return Err(Error::pack(
                        temp_path,
                        format!(
                            "content hash mismatch: declared {}, read {}",
                            record.hash.short(),
                            actual.short()
                        ),
                    ));
                }
                pos = start + record.size;
            }
            sink.flush_chunk()?;
            sink.out.flush()?;
            sink.chunks
        };

        if chunks.len() != chunk_count as usize {
            return Err(Error::pack(
                temp_path,
                format!("wrote {} chunks, planned {}", chunks.len(), chunk_count),
            ));
        }

        // Tables
        let mut tables = Vec::with_capacity(data_offset as usize - HEADER_SIZE);
        for chunk in &chunks {
            tables.extend_from_slice(&chunk.encode());
        }
        for entry in &entries {
            tables.extend_from_slice(&entry.encode());
        }
        let header = ContainerHeader {
            chunk_size: self.options.chunk_size,
            chunk_count,
            entry_count,
            table_crc: crc32fast::hash(&tables),
            total_size,
            data_offset,
        };

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.write_all(&tables)?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();

        Ok(PackedContainer {
            path: temp_path.to_path_buf(),
            entries,
            chunk_count,
            total_size,
            file_size,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// In-memory source whose declared hash may be wrong on purpose.
    pub(crate) struct MemSource {
        pub hash: ContentHash,
        pub data: Vec<u8>,
        pub declared_size: u64,
    }

    impl MemSource {
        pub(crate) fn new(data: &[u8]) -> Self {
            Self {
                hash: ContentHash::hash_bytes(data),
                data: data.to_vec(),
                declared_size: data.len() as u64,
            }
        }
    }

    impl EntrySource for MemSource {
        fn hash(&self) -> ContentHash {
            self.hash
        }
        fn size(&self) -> u64 {
            self.declared_size
        }
        fn open(&self) -> Result<Box<dyn Read + '_>> {
            Ok(Box::new(&self.data[..]))
        }
    }

    fn options(chunk_size: u32) -> PackOptions {
        PackOptions {
            chunk_size,
            ..PackOptions::default()
        }
    }

    #[test]
    fn test_layout_aligns_large_entries() {
        let h = ContentHash::hash_bytes;
        let (records, total) = plan_layout(
            &[(h(b"a"), 10), (h(b"b"), 100), (h(b"c"), 5), (h(b"d"), 0)],
            64,
        );
        assert_eq!((records[0].first_chunk, records[0].intra_offset), (0, 0));
        // 100 >= 64, so it jumps to the next boundary
        assert_eq!((records[1].first_chunk, records[1].intra_offset), (1, 0));
        // small entries follow densely
        assert_eq!((records[2].first_chunk, records[2].intra_offset), (2, 36));
        assert_eq!(records[3].stream_offset(64), 64 + 100 + 5);
        assert_eq!(total, 169);
    }

    #[test]
    fn test_pack_writes_final_file_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("c.lkc");
        let sources = vec![
            MemSource::new(b"hello"),
            MemSource::new(&vec![3u8; 10_000]),
            MemSource::new(b"hello"),
        ];
        let packed = ContainerWriter::new(options(4096))
            .pack(&path, &sources, &CancellationToken::new())
            .unwrap();

        assert!(path.exists());
        assert!(!temp_path_for(&path).exists());
        assert_eq!(packed.entries.len(), 2, "duplicate hash packed once");
        assert_eq!(packed.total_size, 4096 + 10_000);
        assert_eq!(packed.chunk_count, 4);
        assert_eq!(packed.file_size, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_pack_rejects_hash_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.lkc");
        let mut source = MemSource::new(b"actual bytes");
        source.hash = ContentHash::hash_bytes(b"something else");

        let err = ContainerWriter::default()
            .pack(&path, &[source], &CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
        assert!(!path.exists());
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_pack_rejects_size_mismatch() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let writer = ContainerWriter::new(options(4096));

        let mut short = MemSource::new(b"0123456789");
        short.declared_size = 20;
        let err = writer
            .pack(&temp.path().join("a.lkc"), &[short], &cancel)
            .unwrap_err();
        assert!(err.to_string().contains("before its declared size"));

        let mut long = MemSource::new(b"0123456789");
        long.declared_size = 4;
        let err = writer
            .pack(&temp.path().join("b.lkc"), &[long], &cancel)
            .unwrap_err();
        assert!(err.to_string().contains("longer than"));
    }

    #[test]
    fn test_pack_cancelled() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("c.lkc");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ContainerWriter::default().pack(&path, &[MemSource::new(b"x")], &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!path.exists());
    }
}
