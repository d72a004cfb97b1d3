//! Content-addressed file storage.
//!
//! [`ContentStore`] is the seam between the synchronizer and the on-disk
//! archive format. Two backends exist: [`ContainerStore`] (chunked
//! containers, the default) and [`LooseStore`] (one object file per hash).

mod container_store;
mod loose;

pub use container_store::ContainerStore;
pub use loose::LooseStore;

use crate::config::{Backend, Config};
use crate::container::{EntrySource, PackOptions};
use crate::datastore::Datastore;
use crate::error::Result;
use crate::gc::GcStats;
use crate::hash::ContentHash;
use crate::throttle::{CancellationToken, ThroughputLimiter};
use rayon::ThreadPool;
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the bytes of a backup entry come from. Opened lazily while packing.
#[derive(Debug, Clone)]
pub enum StreamSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// One file offered to [`ContentStore::backup_files`].
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub source: StreamSource,
    pub hash: ContentHash,
    pub size: u64,
}

impl BackupEntry {
    pub fn new(source: StreamSource, hash: ContentHash, size: u64) -> Self {
        Self { source, hash, size }
    }

    /// Entry for in-memory bytes, hashing them.
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        let data: Arc<[u8]> = data.into();
        Self {
            hash: ContentHash::hash_bytes(&data),
            size: data.len() as u64,
            source: StreamSource::Bytes(data),
        }
    }

    /// Entry for a file on disk, hashing it now.
    pub fn from_path(path: &Path) -> Result<Self> {
        let size = fs::metadata(path)?.len();
        let hash = ContentHash::hash_file(path)?;
        Ok(Self::new(StreamSource::Path(path.to_path_buf()), hash, size))
    }
}

impl EntrySource for BackupEntry {
    fn hash(&self) -> ContentHash {
        self.hash
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> Result<Box<dyn Read + '_>> {
        match &self.source {
            StreamSource::Path(path) => Ok(Box::new(std::io::BufReader::new(fs::File::open(path)?))),
            StreamSource::Bytes(data) => Ok(Box::new(&data[..])),
        }
    }
}

/// Outcome of a backup call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    /// Name of the container written, if anything new was stored.
    pub container: Option<String>,
    /// Hashes stored by this call.
    pub stored: Vec<ContentHash>,
    /// Entries skipped because their content was already stored or repeated.
    pub skipped: usize,
}

/// Requested destination of one extracted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub hash: ContentHash,
    pub destination: PathBuf,
}

impl ExtractRequest {
    pub fn new(hash: ContentHash, destination: impl Into<PathBuf>) -> Self {
        Self {
            hash,
            destination: destination.into(),
        }
    }
}

/// Seekable stream returned by [`ContentStore::get_file_stream`].
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub type FileStream = Box<dyn ReadSeek>;

/// Computes the live hash set for [`ContentStore::sweep`].
pub type Reachable<'a> = dyn Fn() -> Result<HashSet<ContentHash>> + 'a;

/// Content-addressed storage backend.
pub trait ContentStore: Send + Sync {
    /// Short backend identifier for logs and reports.
    fn backend_name(&self) -> &'static str;

    /// True if the content is stored and readable.
    fn have_file(&self, hash: &ContentHash) -> Result<bool>;

    /// Store every entry whose content is not already present.
    ///
    /// Nothing is written when all entries are already stored.
    fn backup_files(
        &self,
        entries: Vec<BackupEntry>,
        cancel: &CancellationToken,
    ) -> Result<BackupReport>;

    /// Lazily decompressing stream over stored content.
    fn get_file_stream(&self, hash: &ContentHash) -> Result<FileStream>;

    /// Write stored content to the requested destinations.
    ///
    /// Fails before writing anything if any hash cannot be resolved.
    fn extract_files(&self, requests: &[ExtractRequest], cancel: &CancellationToken) -> Result<()>;

    /// Every hash the store knows about.
    fn get_file_hashes(&self) -> Result<HashSet<ContentHash>>;

    /// Delete stored content that `reachable` does not return.
    ///
    /// `reachable` runs after backups are shut out and before anything is
    /// deleted, so content a backup committed earlier is never mistaken for
    /// garbage because the set was computed too soon.
    fn sweep(&self, reachable: &Reachable<'_>, dry_run: bool) -> Result<GcStats>;
}

/// Construct the configured backend; `limiter` throttles extraction.
pub fn open_store(
    config: &Config,
    datastore: Arc<dyn Datastore>,
    pool: Arc<ThreadPool>,
    limiter: Arc<ThroughputLimiter>,
) -> Result<Arc<dyn ContentStore>> {
    let store: Arc<dyn ContentStore> = match config.backend {
        Backend::Container => Arc::new(
            ContainerStore::new(
                datastore,
                config.storage_locations.clone(),
                PackOptions {
                    chunk_size: config.container.chunk_size,
                    method: config.container.method,
                    level: config.container.compression_level,
                },
                pool,
            )?
            .with_limiter(limiter),
        ),
        Backend::Loose => {
            let root = config
                .storage_locations
                .first()
                .cloned()
                .unwrap_or_else(|| config.data_dir.join("objects"));
            Arc::new(
                LooseStore::open(root, config.container.compression_level, pool)?
                    .with_limiter(limiter),
            )
        }
    };
    tracing::debug!(backend = store.backend_name(), "opened content store");
    Ok(store)
}

/// Bytes copied between cancellation checks while extracting.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Write a stream to `dest` atomically, replacing any existing file.
///
/// Cancellation is checked and `limiter` charged once per chunk. A
/// cancelled write leaves `dest` as it was.
pub(crate) fn write_stream_atomic(
    dest: &Path,
    reader: &mut dyn Read,
    cancel: &CancellationToken,
    limiter: &ThroughputLimiter,
) -> Result<u64> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    // Write atomically using tempfile
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        limiter.acquire(n as u64)?;
        temp_file.write_all(&buf[..n])?;
        written += n as u64;
    }
    temp_file.flush()?;
    temp_file.as_file().sync_data()?;

    // Persist atomically
    temp_file.persist(dest)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use tempfile::TempDir;

    #[test]
    fn test_backup_entry_sources() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"on disk").unwrap();

        let from_path = BackupEntry::from_path(&path).unwrap();
        assert_eq!(from_path.hash, ContentHash::hash_bytes(b"on disk"));
        let mut buf = Vec::new();
        from_path.open().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"on disk");

        let from_bytes = BackupEntry::from_bytes(b"in memory".to_vec());
        assert_eq!(from_bytes.size, 9);
        buf.clear();
        from_bytes.open().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"in memory");
    }

    #[test]
    fn test_write_stream_atomic_replaces() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("a/b/c.txt");
        let cancel = CancellationToken::new();
        let limiter = ThroughputLimiter::unlimited();
        write_stream_atomic(&dest, &mut &b"one"[..], &cancel, &limiter).unwrap();
        write_stream_atomic(&dest, &mut &b"two!"[..], &cancel, &limiter).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"two!");
        assert_eq!(fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }

    /// Reader that requests cancellation after handing out its first chunk.
    struct CancelAfterFirstRead {
        data: Vec<u8>,
        pos: usize,
        cancel: CancellationToken,
    }

    impl Read for CancelAfterFirstRead {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            self.cancel.cancel();
            Ok(n)
        }
    }

    #[test]
    fn test_write_stream_atomic_cancels_between_chunks() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("big.bin");
        fs::write(&dest, b"previous").unwrap();
        let cancel = CancellationToken::new();
        let mut reader = CancelAfterFirstRead {
            data: vec![7u8; COPY_CHUNK_SIZE * 4],
            pos: 0,
            cancel: cancel.clone(),
        };

        let err = write_stream_atomic(&dest, &mut reader, &cancel, &ThroughputLimiter::unlimited())
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Cancelled));
        // Stopped after one chunk; the old file survives and no temp file is left
        assert_eq!(reader.pos, COPY_CHUNK_SIZE);
        assert_eq!(fs::read(&dest).unwrap(), b"previous");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_stream_atomic_is_throttled() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("slow.bin");
        // 1 MiB/s: the first MiB is free, the remaining 256 KiB waits ~250ms
        let limiter = ThroughputLimiter::new(1024 * 1024);
        let data = vec![1u8; 1024 * 1024 + 256 * 1024];

        let start = std::time::Instant::now();
        let written =
            write_stream_atomic(&dest, &mut &data[..], &CancellationToken::new(), &limiter).unwrap();
        assert_eq!(written, data.len() as u64);
        assert!(start.elapsed() >= std::time::Duration::from_millis(150));
    }

    #[test]
    fn test_open_store_selects_backend() {
        let temp = TempDir::new().unwrap();
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
        let mut config = Config {
            data_dir: temp.path().join("data"),
            storage_locations: vec![temp.path().join("archives")],
            ..Config::default()
        };
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());

        let limiter = Arc::new(ThroughputLimiter::unlimited());
        let store = open_store(
            &config,
            Arc::clone(&datastore),
            Arc::clone(&pool),
            Arc::clone(&limiter),
        )
        .unwrap();
        assert_eq!(store.backend_name(), "container");

        config.backend = Backend::Loose;
        let store = open_store(&config, datastore, pool, limiter).unwrap();
        assert_eq!(store.backend_name(), "loose");
    }
}
