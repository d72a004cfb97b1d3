//! Legacy loose-object store: one compressed file per hash.
//!
//! Objects live at `objects/{prefix}/{suffix}` with a 16-byte header:
//!
//! ```text
//! 0x00  4   "LKOB" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   compression: 0=none, 1=zstd
//! 0x06  2   reserved (must be 0)
//! 0x08  8   payload_len (u64 LE) - stored size
//! 0x10  ... payload
//! ```

use super::{
    BackupEntry, BackupReport, ContentStore, ExtractRequest, FileStream, Reachable,
    write_stream_atomic,
};
use crate::container::{EntrySource, compress_zstd_all, decompress_zstd_all};
use crate::error::{Error, Result};
use crate::gc::GcStats;
use crate::hash::ContentHash;
use crate::throttle::{CancellationToken, ThroughputLimiter};
use byteorder::{ByteOrder, LittleEndian};
use rayon::ThreadPool;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const MAGIC: &[u8; 4] = b"LKOB";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 16;

/// Compression threshold: objects >= 4KB are compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// One file per hash under `{root}/objects`.
///
/// Backups hold the gate shared and sweeps exclusively, as in
/// [`ContainerStore`](super::ContainerStore).
#[derive(Debug)]
pub struct LooseStore {
    root: PathBuf,
    level: i32,
    pool: Arc<ThreadPool>,
    limiter: Arc<ThroughputLimiter>,
    gate: RwLock<()>,
}

impl LooseStore {
    pub fn open<P: AsRef<Path>>(root: P, level: i32, pool: Arc<ThreadPool>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        Ok(Self {
            root,
            level,
            pool,
            limiter: Arc::new(ThroughputLimiter::unlimited()),
            gate: RwLock::new(()),
        })
    }

    /// Throttle extraction with `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<ThroughputLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Get the path to an object file given its hash.
    ///
    /// Returns: `objects/{prefix}/{suffix}`
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.root
            .join("objects")
            .join(hash.prefix())
            .join(hash.suffix())
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn write_object(&self, entry: &BackupEntry, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        let obj_path = self.object_path(&entry.hash);

        let mut data = Vec::with_capacity(entry.size as usize);
        entry.open()?.read_to_end(&mut data)?;
        if data.len() as u64 != entry.size {
            return Err(Error::pack(
                &obj_path,
                format!("declared {} bytes, read {}", entry.size, data.len()),
            ));
        }
        let actual = ContentHash::hash_bytes(&data);
        if actual != entry.hash {
            return Err(Error::pack(
                &obj_path,
                format!(
                    "content hash mismatch: declared {}, read {}",
                    entry.hash.short(),
                    actual.short()
                ),
            ));
        }

        let (compression, payload) = if data.len() >= COMPRESSION_THRESHOLD {
            (1u8, compress_zstd_all(&data, self.level)?)
        } else {
            (0u8, data)
        };

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(MAGIC);
        header[4] = VERSION;
        header[5] = compression;
        LittleEndian::write_u64(&mut header[8..16], payload.len() as u64);

        // Create parent directory if needed
        let dir = self.objects_dir().join(entry.hash.prefix());
        fs::create_dir_all(&dir)?;

        // Write atomically using tempfile
        let mut temp_file = tempfile::NamedTempFile::new_in(&dir)?;
        temp_file.write_all(&header)?;
        temp_file.write_all(&payload)?;
        temp_file.flush()?;
        temp_file.persist(&obj_path)?;
        Ok(())
    }

    fn read_object(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        if !path.is_file() {
            return Err(Error::missing_content(hash.to_hex()));
        }
        let bytes = fs::read(&path)?;
        if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC || bytes[4] != VERSION {
            return Err(Error::corrupted_container(&path, "invalid object header"));
        }
        let payload_len = LittleEndian::read_u64(&bytes[8..16]);
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() as u64 != payload_len {
            return Err(Error::corrupted_container(
                &path,
                format!(
                    "Payload length mismatch: expected {}, got {}",
                    payload_len,
                    payload.len()
                ),
            ));
        }
        let data = match bytes[5] {
            0 => payload.to_vec(),
            1 => decompress_zstd_all(payload)?,
            other => {
                return Err(Error::corrupted_container(
                    &path,
                    format!("Invalid compression type: {}", other),
                ));
            }
        };
        if ContentHash::hash_bytes(&data) != *hash {
            return Err(Error::corrupted_container(&path, "content hash mismatch"));
        }
        Ok(data)
    }
}

impl ContentStore for LooseStore {
    fn backend_name(&self) -> &'static str {
        "loose"
    }

    fn have_file(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.object_path(hash).is_file())
    }

    fn backup_files(
        &self,
        entries: Vec<BackupEntry>,
        cancel: &CancellationToken,
    ) -> Result<BackupReport> {
        let _span = tracing::info_span!("backup", offered = entries.len()).entered();
        let _gate = self.gate.read()?;
        let offered = entries.len();
        let mut seen = HashSet::new();
        let new_entries: Vec<BackupEntry> = entries
            .into_iter()
            .filter(|e| seen.insert(e.hash) && !self.object_path(&e.hash).exists())
            .collect();

        self.pool.install(|| {
            new_entries
                .par_iter()
                .try_for_each(|entry| self.write_object(entry, cancel))
        })?;

        let stored: Vec<ContentHash> = new_entries.iter().map(|e| e.hash).collect();
        if !stored.is_empty() {
            tracing::info!(stored = stored.len(), "backed up loose objects");
        }
        Ok(BackupReport {
            container: None,
            skipped: offered - stored.len(),
            stored,
        })
    }

    fn get_file_stream(&self, hash: &ContentHash) -> Result<FileStream> {
        Ok(Box::new(Cursor::new(self.read_object(hash)?)))
    }

    fn extract_files(&self, requests: &[ExtractRequest], cancel: &CancellationToken) -> Result<()> {
        if let Some(missing) = requests.iter().find(|r| !self.object_path(&r.hash).is_file()) {
            return Err(Error::missing_content(missing.hash.to_hex()));
        }
        self.pool.install(|| {
            requests.par_iter().try_for_each(|request| -> Result<()> {
                cancel.check()?;
                let data = self.read_object(&request.hash)?;
                write_stream_atomic(&request.destination, &mut &data[..], cancel, &self.limiter)?;
                Ok(())
            })
        })
    }

    fn get_file_hashes(&self) -> Result<HashSet<ContentHash>> {
        let mut hashes = HashSet::new();
        for (hash, _) in walk_objects(&self.objects_dir())? {
            hashes.insert(hash);
        }
        Ok(hashes)
    }

    fn sweep(&self, reachable: &Reachable<'_>, dry_run: bool) -> Result<GcStats> {
        let _gate = self.gate.write()?;
        let reachable = reachable()?;
        let mut stats = GcStats::default();
        for (hash, obj_path) in walk_objects(&self.objects_dir())? {
            if reachable.contains(&hash) {
                continue;
            }
            let metadata = fs::metadata(&obj_path)?;
            stats.bytes_freed += metadata.len();
            stats.containers_deleted += 1;
            if !dry_run {
                fs::remove_file(&obj_path)?;
            }
        }

        // Remove empty shard directories (only if not dry run)
        if !dry_run {
            for shard in fs::read_dir(self.objects_dir())? {
                let shard_path = shard?.path();
                if shard_path.is_dir()
                    && let Ok(mut entries) = fs::read_dir(&shard_path)
                    && entries.next().is_none()
                {
                    let _ = fs::remove_dir(&shard_path);
                }
            }
        }
        Ok(stats)
    }
}

/// Every object file as `(hash, path)`. Unparseable names are skipped.
fn walk_objects(objects_dir: &Path) -> Result<Vec<(ContentHash, PathBuf)>> {
    let mut objects = Vec::new();
    if !objects_dir.exists() {
        return Ok(objects);
    }
    for shard_entry in fs::read_dir(objects_dir)? {
        let shard_path = shard_entry?.path();
        if !shard_path.is_dir() {
            continue;
        }
        let prefix = shard_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        for obj_entry in fs::read_dir(&shard_path)? {
            let obj_path = obj_entry?.path();
            if !obj_path.is_file() {
                continue;
            }
            let suffix = obj_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if let Ok(hash) = ContentHash::from_hex(&format!("{}{}", prefix, suffix)) {
                objects.push((hash, obj_path));
            }
        }
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> LooseStore {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        LooseStore::open(temp.path().join("loose"), 3, pool).unwrap()
    }

    #[test]
    fn test_backup_read_dedup() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let cancel = CancellationToken::new();
        let small = BackupEntry::from_bytes(b"small".to_vec());
        let large = BackupEntry::from_bytes(vec![5u8; 50_000]);

        let report = store
            .backup_files(vec![small.clone(), large.clone()], &cancel)
            .unwrap();
        assert_eq!(report.stored.len(), 2);
        let again = store.backup_files(vec![small.clone()], &cancel).unwrap();
        assert!(again.stored.is_empty());
        assert_eq!(again.skipped, 1);

        // Large payload was compressed on disk
        assert!(fs::metadata(store.object_path(&large.hash)).unwrap().len() < 50_000);

        let mut out = Vec::new();
        store
            .get_file_stream(&large.hash)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, vec![5u8; 50_000]);
        assert_eq!(store.get_file_hashes().unwrap().len(), 2);
    }

    #[test]
    fn test_extract_fails_fast() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let cancel = CancellationToken::new();
        let a = BackupEntry::from_bytes(b"a".to_vec());
        store.backup_files(vec![a.clone()], &cancel).unwrap();

        let dest = temp.path().join("out");
        let err = store
            .extract_files(
                &[
                    ExtractRequest::new(a.hash, dest.join("a")),
                    ExtractRequest::new(ContentHash::hash_bytes(b"nope"), dest.join("b")),
                ],
                &cancel,
            )
            .unwrap_err();
        assert!(err.is_missing_content());
        assert!(!dest.join("a").exists());

        store
            .extract_files(&[ExtractRequest::new(a.hash, dest.join("a"))], &cancel)
            .unwrap();
        assert_eq!(fs::read(dest.join("a")).unwrap(), b"a");
    }

    #[test]
    fn test_sweep_removes_unreachable_and_empty_shards() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let cancel = CancellationToken::new();
        let keep = BackupEntry::from_bytes(b"keep".to_vec());
        let dead = BackupEntry::from_bytes(b"dead".to_vec());
        store
            .backup_files(vec![keep.clone(), dead.clone()], &cancel)
            .unwrap();

        let reachable: HashSet<ContentHash> = [keep.hash].into_iter().collect();
        let stats = store.sweep(&|| Ok(reachable.clone()), false).unwrap();
        assert_eq!(stats.containers_deleted, 1);
        assert!(store.have_file(&keep.hash).unwrap());
        assert!(!store.have_file(&dead.hash).unwrap());
        if keep.hash.prefix() != dead.hash.prefix() {
            assert!(!store.object_path(&dead.hash).parent().unwrap().exists());
        }
        assert_eq!(store.sweep(&|| Ok(reachable.clone()), false).unwrap(), GcStats::default());
    }

    #[test]
    fn test_corrupted_object_detected() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let entry = BackupEntry::from_bytes(b"fragile".to_vec());
        store
            .backup_files(vec![entry.clone()], &CancellationToken::new())
            .unwrap();
        let path = store.object_path(&entry.hash);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert!(store.get_file_stream(&entry.hash).is_err());
    }
}
