//! Random-access reads from containers.

use super::compression::decompress_chunk_into;
use super::format::{
    CHUNK_RECORD_SIZE, ChunkRecord, ContainerHeader, ENTRY_RECORD_SIZE, EntryRecord, HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Chunk-addressable view of one file's bytes.
///
/// Chunk `i` covers bytes `i * chunk_size ..` of the file; every chunk is
/// `chunk_size` long except possibly the last.
pub trait ChunkedReadable {
    fn size(&self) -> u64;
    fn chunk_size(&self) -> u32;

    /// Number of chunks; fails if the size does not fit the chunk index.
    fn chunk_count(&self) -> Result<u32>;

    /// Length of chunk `index`, clamped for the last chunk.
    fn chunk_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size() as u64;
        self.size()
            .saturating_sub(start)
            .min(self.chunk_size() as u64) as usize
    }

    /// Decompress chunk `index` into the front of `buf`, returning its length.
    fn read_chunk_into(&self, index: u32, buf: &mut [u8]) -> Result<usize>;

    fn read_chunk(&self, index: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_len(index)];
        let n = self.read_chunk_into(index, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// An open, validated container file.
///
/// Shared between readers through `Arc`; the file handle is only locked while
/// compressed bytes are read.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    header: ContainerHeader,
    chunks: Vec<ChunkRecord>,
    entries: Vec<EntryRecord>,
    by_hash: HashMap<ContentHash, usize>,
    file: Mutex<File>,
}

impl Container {
    /// Open a container, validating the header, table CRC and all ranges.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)
            .map_err(|_| Error::corrupted_container(&path, "file shorter than header"))?;
        let header = ContainerHeader::decode(&header_buf, &path)?;

        if file_len < header.data_offset {
            return Err(Error::corrupted_container(&path, "file shorter than its tables"));
        }
        let mut tables = vec![0u8; header.data_offset as usize - HEADER_SIZE];
        file.read_exact(&mut tables)?;
        if crc32fast::hash(&tables) != header.table_crc {
            return Err(Error::corrupted_container(&path, "table checksum mismatch"));
        }

        let data_len = file_len - header.data_offset;
        let (chunk_bytes, entry_bytes) =
            tables.split_at(header.chunk_count as usize * CHUNK_RECORD_SIZE);

        let mut chunks = Vec::with_capacity(header.chunk_count as usize);
        for raw in chunk_bytes.chunks_exact(CHUNK_RECORD_SIZE) {
            let chunk = ChunkRecord::decode(raw, &path)?;
            if chunk.offset + chunk.compressed_size as u64 > data_len {
                return Err(Error::corrupted_container(
                    &path,
                    format!("chunk {} extends past end of file", chunks.len()),
                ));
            }
            chunks.push(chunk);
        }

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        let mut by_hash = HashMap::with_capacity(header.entry_count as usize);
        for raw in entry_bytes.chunks_exact(ENTRY_RECORD_SIZE) {
            let entry = EntryRecord::decode(raw, &path)?;
            let end = entry.stream_offset(header.chunk_size) + entry.size;
            if entry.size > 0 && end > header.total_size {
                return Err(Error::corrupted_container(
                    &path,
                    format!("entry {} extends past end of stream", entry.hash.short()),
                ));
            }
            by_hash.entry(entry.hash).or_insert(entries.len());
            entries.push(entry);
        }

        tracing::debug!(
            path = %path.display(),
            chunks = chunks.len(),
            entries = entries.len(),
            "opened container"
        );

        Ok(Self {
            path,
            header,
            chunks,
            entries,
            by_hash,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn entries(&self) -> &[EntryRecord] {
        &self.entries
    }

    /// Entry record for `hash`, if this container holds it.
    pub fn find_entry(&self, hash: &ContentHash) -> Option<&EntryRecord> {
        self.by_hash.get(hash).map(|&i| &self.entries[i])
    }

    /// Read and checksum the compressed bytes of chunk `index`.
    fn read_compressed_chunk(&self, index: u32) -> Result<(ChunkRecord, Vec<u8>)> {
        let chunk = *self.chunks.get(index as usize).ok_or_else(|| {
            Error::corrupted_container(
                &self.path,
                format!("chunk {} out of range ({} chunks)", index, self.chunks.len()),
            )
        })?;
        let mut data = vec![0u8; chunk.compressed_size as usize];
        {
            let mut file = self.file.lock()?;
            file.seek(SeekFrom::Start(self.header.data_offset + chunk.offset))?;
            file.read_exact(&mut data)?;
        }
        if crc32fast::hash(&data) != chunk.crc32 {
            return Err(Error::corrupted_container(
                &self.path,
                format!("chunk {} checksum mismatch", index),
            ));
        }
        Ok((chunk, data))
    }

    /// Decompress container chunk `index` into `out` (exactly its length).
    fn decompress_chunk_into(&self, index: u32, out: &mut [u8]) -> Result<()> {
        let (chunk, data) = self.read_compressed_chunk(index)?;
        decompress_chunk_into(chunk.method, &data, out)
            .map_err(|e| Error::corrupted_container(&self.path, format!("chunk {}: {}", index, e)))
    }

    /// Decompress a whole container chunk.
    pub fn decompress_chunk(&self, index: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.header.chunk_len(index)];
        self.decompress_chunk_into(index, &mut out)?;
        Ok(out)
    }

    /// Chunked view of the entry for `hash`.
    pub fn open_entry(self: &Arc<Self>, hash: &ContentHash) -> Result<EntryChunks> {
        let entry = *self
            .find_entry(hash)
            .ok_or_else(|| Error::missing_content(hash.to_hex()))?;
        Ok(EntryChunks {
            container: Arc::clone(self),
            entry,
        })
    }
}

/// One entry of a container, addressed in entry-local chunks.
#[derive(Debug, Clone)]
pub struct EntryChunks {
    container: Arc<Container>,
    entry: EntryRecord,
}

impl EntryChunks {
    pub fn entry(&self) -> &EntryRecord {
        &self.entry
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Sequential reader over the entry's bytes.
    pub fn into_reader(self) -> EntryReader<Self> {
        EntryReader::new(self)
    }
}

impl ChunkedReadable for EntryChunks {
    fn size(&self) -> u64 {
        self.entry.size
    }

    fn chunk_size(&self) -> u32 {
        self.container.header.chunk_size
    }

    fn chunk_count(&self) -> Result<u32> {
        let count = self.entry.size.div_ceil(self.chunk_size() as u64);
        u32::try_from(count).map_err(|_| {
            Error::corrupted_container(
                &self.container.path,
                format!("entry {} spans {} chunks", self.entry.hash.short(), count),
            )
        })
    }

    fn read_chunk_into(&self, index: u32, buf: &mut [u8]) -> Result<usize> {
        if index >= self.chunk_count()? {
            return Err(Error::corrupted_container(
                &self.container.path,
                format!(
                    "local chunk {} out of range for entry {}",
                    index,
                    self.entry.hash.short()
                ),
            ));
        }
        let len = self.chunk_len(index);
        if buf.len() < len {
            return Err(Error::io_other(format!(
                "buffer of {} bytes cannot hold chunk of {}",
                buf.len(),
                len
            )));
        }
        let out = &mut buf[..len];
        let header = &self.container.header;
        let cs = header.chunk_size as u64;

        // Fast path: the entry is chunk-aligned and owns this container chunk
        let aligned_chunk = self.entry.first_chunk + index;
        if self.entry.intra_offset == 0 && header.chunk_len(aligned_chunk) == len {
            self.container.decompress_chunk_into(aligned_chunk, out)?;
            return Ok(len);
        }

        // Shared chunk: decompress each overlapping container chunk and copy the slice
        let start = self.entry.stream_offset(header.chunk_size) + index as u64 * cs;
        let end = start + len as u64;
        let mut written = 0usize;
        let mut scratch = Vec::new();
        let mut chunk = (start / cs) as u32;
        while written < len {
            let chunk_start = chunk as u64 * cs;
            scratch.resize(header.chunk_len(chunk), 0);
            self.container.decompress_chunk_into(chunk, &mut scratch)?;
            let from = (start + written as u64 - chunk_start) as usize;
            let to = ((end - chunk_start) as usize).min(scratch.len());
            let n = to - from;
            out[written..written + n].copy_from_slice(&scratch[from..to]);
            written += n;
            chunk += 1;
        }
        Ok(len)
    }
}

/// `Read + Seek` over any [`ChunkedReadable`], decompressing one chunk at a time.
#[derive(Debug)]
pub struct EntryReader<C: ChunkedReadable> {
    chunks: C,
    position: u64,
    buffer: Vec<u8>,
    buffered: Option<u32>,
}

impl<C: ChunkedReadable> EntryReader<C> {
    pub fn new(chunks: C) -> Self {
        Self {
            chunks,
            position: 0,
            buffer: Vec::new(),
            buffered: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.chunks.size()
    }

    pub fn into_inner(self) -> C {
        self.chunks
    }
}

impl<C: ChunkedReadable> Read for EntryReader<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.chunks.size() {
            return Ok(0);
        }
        let cs = self.chunks.chunk_size() as u64;
        let index = (self.position / cs) as u32;
        let within = (self.position % cs) as usize;

        if self.buffered != Some(index) {
            let len = self.chunks.chunk_len(index);
            self.buffer.resize(len, 0);
            self.chunks
                .read_chunk_into(index, &mut self.buffer)
                .map_err(io::Error::other)?;
            self.buffered = Some(index);
        }

        let available = &self.buffer[within..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<C: ChunkedReadable> Seek for EntryReader<C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.chunks.size() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => size + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of entry",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}
