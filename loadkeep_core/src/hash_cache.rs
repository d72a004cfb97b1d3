//! Persistent file hash cache.
//!
//! Entries are keyed by normalized absolute path. A hit is only valid while
//! the file's size and modification time still match the recorded values.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::throttle::{CancellationToken, ThrottledReader, ThroughputLimiter};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

/// Results buffered between the hashing workers and the consumer.
const CHANNEL_BOUND: usize = 256;

const CACHE_VERSION: u32 = 1;

/// Cached digest of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: ContentHash,
    pub size: u64,
    pub modified_nanos: u64,
}

/// A hashed file as yielded by [`HashCache::hash_file`] and [`FolderHashes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
    pub modified_nanos: u64,
}

/// A file that could not be hashed.
#[derive(Debug)]
pub struct HashFailure {
    pub path: PathBuf,
    pub error: Error,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<CacheRecord>,
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    path: PathBuf,
    #[serde(flatten)]
    entry: CacheEntry,
}

/// Modification time in nanoseconds since the Unix epoch (0 before it).
pub fn modified_nanos(metadata: &fs::Metadata) -> Result<u64> {
    let modified = metadata.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0))
}

/// Make `path` absolute and resolve `.`/`..` lexically.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path)?;
    let mut out = PathBuf::new();
    for component in abs.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Path/size/mtime keyed hash cache, shared across worker threads.
#[derive(Debug)]
pub struct HashCache {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    dirty: AtomicBool,
}

impl HashCache {
    /// Load the cache file at `path`, or start empty if it doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();

        if path.exists() {
            let content = fs::read(&path)?;
            match serde_json::from_slice::<CacheFile>(&content) {
                Ok(file) if file.version == CACHE_VERSION => {
                    for record in file.entries {
                        entries.insert(record.path, record.entry);
                    }
                }
                Ok(file) => {
                    tracing::warn!(
                        path = %path.display(),
                        version = file.version,
                        "discarding hash cache with unknown version"
                    );
                }
                Err(err) => {
                    // The cache is derived data; rebuilding it is always safe
                    tracing::warn!(path = %path.display(), error = %err, "discarding unreadable hash cache");
                }
            }
        }

        tracing::debug!(path = %path.display(), entries = entries.len(), "opened hash cache");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    /// Cache that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw cached entry, without validating it against the file.
    pub fn lookup(&self, path: &Path) -> Result<Option<CacheEntry>> {
        let key = normalize_path(path)?;
        Ok(self.entries.read()?.get(&key).copied())
    }

    /// Hash a file, reusing the cached digest if size and mtime match.
    pub fn hash_file(&self, path: &Path, cancel: &CancellationToken) -> Result<HashedFile> {
        self.hash_file_limited(path, None, cancel)
    }

    fn hash_file_limited(
        &self,
        path: &Path,
        limiter: Option<&ThroughputLimiter>,
        cancel: &CancellationToken,
    ) -> Result<HashedFile> {
        let key = normalize_path(path)?;
        let metadata = fs::metadata(&key)?;
        if !metadata.is_file() {
            return Err(Error::io_other(format!("not a regular file: {}", key.display())));
        }
        let size = metadata.len();
        let mtime = modified_nanos(&metadata)?;

        // Check cache
        if let Some(entry) = self.entries.read()?.get(&key)
            && entry.size == size
            && entry.modified_nanos == mtime
        {
            return Ok(HashedFile {
                path: key,
                hash: entry.hash,
                size,
                modified_nanos: mtime,
            });
        }

        let file = fs::File::open(&key)?;
        let (hash, read) = match limiter {
            Some(limiter) => {
                ContentHash::hash_reader_cancellable(ThrottledReader::new(file, limiter), cancel)?
            }
            None => ContentHash::hash_reader_cancellable(file, cancel)?,
        };

        // Only cache if the file did not change underneath us
        let after = fs::metadata(&key)?;
        if read == size && after.len() == size && modified_nanos(&after)? == mtime {
            self.insert(
                key.clone(),
                CacheEntry {
                    hash,
                    size,
                    modified_nanos: mtime,
                },
            )?;
        } else {
            tracing::debug!(path = %key.display(), "file changed while hashing, not caching");
        }

        Ok(HashedFile {
            path: key,
            hash,
            size: read,
            modified_nanos: mtime,
        })
    }

    /// Record a digest the caller already knows (e.g. a file just extracted).
    pub fn record(&self, path: &Path, hash: ContentHash, size: u64, modified_nanos: u64) -> Result<()> {
        let key = normalize_path(path)?;
        self.insert(
            key,
            CacheEntry {
                hash,
                size,
                modified_nanos,
            },
        )
    }

    fn insert(&self, key: PathBuf, entry: CacheEntry) -> Result<()> {
        let previous = self.entries.write()?.insert(key, entry);
        if previous != Some(entry) {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Drop entries whose files no longer exist. Returns how many were removed.
    pub fn prune_missing(&self) -> Result<usize> {
        let mut entries = self.entries.write()?;
        let before = entries.len();
        entries.retain(|path, _| path.is_file());
        let removed = before - entries.len();
        if removed > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }

    /// Persist atomically if anything changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut records: Vec<CacheRecord> = self
            .entries
            .read()?
            .iter()
            .filter(|(path, _)| path.to_str().is_some())
            .map(|(path, entry)| CacheRecord {
                path: path.clone(),
                entry: *entry,
            })
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let count = records.len();
        let encoded = serde_json::to_vec(&CacheFile {
            version: CACHE_VERSION,
            entries: records,
        })?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        temp_file.write_all(&encoded)?;
        temp_file.flush()?;
        temp_file.persist(path)?;

        tracing::debug!(path = %path.display(), entries = count, "flushed hash cache");
        Ok(())
    }

    /// Hash every file under `roots` on `pool`.
    ///
    /// Returns immediately; results arrive through the iterator as workers
    /// finish, in no particular order. Dropping the iterator stops the
    /// remaining work.
    pub fn hash_folders(
        self: &Arc<Self>,
        roots: Vec<PathBuf>,
        pool: Arc<ThreadPool>,
        limiter: Arc<ThroughputLimiter>,
        cancel: CancellationToken,
    ) -> Result<FolderHashes> {
        let (sender, receiver) = sync_channel(CHANNEL_BOUND);
        let cache = Arc::clone(self);

        std::thread::Builder::new()
            .name("loadkeep-hash-walk".to_string())
            .spawn(move || {
                let files = match walk_files(&roots, &cancel) {
                    Ok(files) => files,
                    Err(failure) => {
                        let _ = sender.send(Err(failure));
                        return;
                    }
                };
                let closed = AtomicBool::new(false);
                pool.install(|| {
                    files.par_iter().for_each_with(sender, |sender, path| {
                        if closed.load(Ordering::Relaxed) || cancel.is_cancelled() {
                            return;
                        }
                        let result = cache
                            .hash_file_limited(path, Some(&limiter), &cancel)
                            .map_err(|error| HashFailure {
                                path: path.clone(),
                                error,
                            });
                        if sender.send(result).is_err() {
                            closed.store(true, Ordering::Relaxed);
                        }
                    });
                });
            })?;

        Ok(FolderHashes { receiver })
    }
}

/// Collect regular files under `roots`. Hidden files are included.
fn walk_files(
    roots: &[PathBuf],
    cancel: &CancellationToken,
) -> std::result::Result<Vec<PathBuf>, HashFailure> {
    let mut files = Vec::new();
    for root in roots {
        if !root.exists() {
            continue;
        }
        let walker = ignore::WalkBuilder::new(root)
            .hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .follow_links(false)
            .build();

        for entry in walker {
            cancel.check().map_err(|error| HashFailure {
                path: root.clone(),
                error,
            })?;
            let entry = entry.map_err(|error| HashFailure {
                path: root.clone(),
                error: error.into(),
            })?;
            if entry.file_type().is_some_and(|t| t.is_file()) {
                files.push(entry.into_path());
            }
        }
    }
    Ok(files)
}

/// Lazy, finite, non-restartable stream of folder hashing results.
pub struct FolderHashes {
    receiver: Receiver<std::result::Result<HashedFile, HashFailure>>,
}

impl Iterator for FolderHashes {
    type Item = std::result::Result<HashedFile, HashFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn pool() -> Arc<ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    #[test]
    fn test_hit_and_invalidation() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, b"first").unwrap();

        let cache = HashCache::in_memory();
        let cancel = CancellationToken::new();
        let first = cache.hash_file(&file, &cancel).unwrap();
        assert_eq!(first.hash, ContentHash::hash_bytes(b"first"));
        assert_eq!(cache.len(), 1);

        // Stale entry with matching stamp is trusted (that is the point of the cache)
        let bogus = ContentHash::hash_bytes(b"bogus");
        cache
            .record(&file, bogus, first.size, first.modified_nanos)
            .unwrap();
        assert_eq!(cache.hash_file(&file, &cancel).unwrap().hash, bogus);

        // Size change invalidates
        fs::write(&file, b"second version").unwrap();
        let second = cache.hash_file(&file, &cancel).unwrap();
        assert_eq!(second.hash, ContentHash::hash_bytes(b"second version"));
        assert_eq!(cache.lookup(&file).unwrap().unwrap().hash, second.hash);
    }

    #[test]
    fn test_path_normalization_shares_entry() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        let file = temp.path().join("sub/f");
        fs::write(&file, b"x").unwrap();

        let cache = HashCache::in_memory();
        cache.hash_file(&file, &CancellationToken::new()).unwrap();
        let dotted = temp.path().join("sub/./../sub/f");
        assert!(cache.lookup(&dotted).unwrap().is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_flush_and_reopen() {
        let temp = TempDir::new().unwrap();
        let cache_path = temp.path().join("meta/hash_cache.json");
        let file = temp.path().join("data.bin");
        fs::write(&file, vec![1u8; 1000]).unwrap();

        let cache = HashCache::open(&cache_path).unwrap();
        let hashed = cache.hash_file(&file, &CancellationToken::new()).unwrap();
        cache.flush().unwrap();
        assert!(cache_path.exists());

        let reopened = HashCache::open(&cache_path).unwrap();
        let entry = reopened.lookup(&file).unwrap().unwrap();
        assert_eq!(entry.hash, hashed.hash);
        assert_eq!(entry.size, 1000);
    }

    #[test]
    fn test_corrupt_cache_file_starts_empty() {
        let temp = TempDir::new().unwrap();
        let cache_path = temp.path().join("hash_cache.json");
        fs::write(&cache_path, b"{not json").unwrap();
        let cache = HashCache::open(&cache_path).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_prune_missing() {
        let temp = TempDir::new().unwrap();
        let keep = temp.path().join("keep");
        let gone = temp.path().join("gone");
        fs::write(&keep, b"k").unwrap();
        fs::write(&gone, b"g").unwrap();

        let cache = HashCache::in_memory();
        let cancel = CancellationToken::new();
        cache.hash_file(&keep, &cancel).unwrap();
        cache.hash_file(&gone, &cancel).unwrap();
        fs::remove_file(&gone).unwrap();

        assert_eq!(cache.prune_missing().unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_hash_folders_yields_every_file() {
        let temp = TempDir::new().unwrap();
        let root_a = temp.path().join("a");
        let root_b = temp.path().join("b");
        fs::create_dir_all(root_a.join("deep/er")).unwrap();
        fs::create_dir_all(&root_b).unwrap();
        fs::write(root_a.join("one"), b"1").unwrap();
        fs::write(root_a.join("deep/er/two"), b"2").unwrap();
        fs::write(root_a.join(".hidden"), b"h").unwrap();
        fs::write(root_b.join("three"), b"3").unwrap();

        let cache = Arc::new(HashCache::in_memory());
        let results: BTreeMap<PathBuf, ContentHash> = cache
            .hash_folders(
                vec![root_a.clone(), root_b.clone(), temp.path().join("missing")],
                pool(),
                Arc::new(ThroughputLimiter::unlimited()),
                CancellationToken::new(),
            )
            .unwrap()
            .map(|r| {
                let f = r.unwrap();
                (f.path, f.hash)
            })
            .collect();

        assert_eq!(results.len(), 4);
        let two = normalize_path(&root_a.join("deep/er/two")).unwrap();
        assert_eq!(results[&two], ContentHash::hash_bytes(b"2"));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_hash_folders_cancelled() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("f"), b"data").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let cache = Arc::new(HashCache::in_memory());
        let results: Vec<_> = cache
            .hash_folders(
                vec![temp.path().to_path_buf()],
                pool(),
                Arc::new(ThroughputLimiter::unlimited()),
                cancel,
            )
            .unwrap()
            .collect();
        assert!(results.iter().all(|r| r.is_err()));
        assert!(cache.is_empty());
    }
}
