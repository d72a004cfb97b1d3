//! Container-backed content store.

use super::{
    BackupEntry, BackupReport, ContentStore, ExtractRequest, FileStream, Reachable,
    write_stream_atomic,
};
use crate::container::{
    CONTAINER_EXTENSION, Container, ContainerWriter, EntryRecord, PackOptions, TEMP_EXTENSION,
};
use crate::datastore::{Datastore, DatastoreExt, Transaction};
use crate::error::{Error, Result};
use crate::gc::GcStats;
use crate::hash::ContentHash;
use crate::throttle::{CancellationToken, ThroughputLimiter};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Datastore prefix of the content index.
pub const CONTENT_PREFIX: &str = "content/";

/// Index value stored under `content/{hash}/{container}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    /// Hex-encoded [`EntryRecord`].
    entry: String,
}

fn index_key(hash: &ContentHash, container: &str) -> String {
    format!("{}{}/{}", CONTENT_PREFIX, hash.to_hex(), container)
}

/// Split an index key into `(hash, container name)`.
fn parse_index_key(key: &str) -> Option<(ContentHash, &str)> {
    let rest = key.strip_prefix(CONTENT_PREFIX)?;
    let (hash, container) = rest.split_once('/')?;
    Some((ContentHash::from_hex(hash).ok()?, container))
}

/// Stores content in immutable multi-file containers.
///
/// The index maps each hash to every container that holds it. The gate
/// is held shared by backups and exclusively by sweeps, so a sweep never
/// sees a container whose index entries are not committed yet.
pub struct ContainerStore {
    datastore: Arc<dyn Datastore>,
    locations: Vec<PathBuf>,
    writer: ContainerWriter,
    pool: Arc<ThreadPool>,
    limiter: Arc<ThroughputLimiter>,
    gate: RwLock<()>,
    open_containers: Mutex<HashMap<PathBuf, Arc<Container>>>,
}

impl std::fmt::Debug for ContainerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerStore")
            .field("locations", &self.locations)
            .field("options", self.writer.options())
            .finish()
    }
}

impl ContainerStore {
    /// Create the store, creating any missing storage location.
    ///
    /// The first location receives new containers; reads resolve across all.
    pub fn new(
        datastore: Arc<dyn Datastore>,
        locations: Vec<PathBuf>,
        options: PackOptions,
        pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        let Some(primary) = locations.first() else {
            return Err(Error::invalid_config("at least one storage location is required"));
        };
        for location in &locations {
            fs::create_dir_all(location)?;
        }
        tracing::debug!(primary = %primary.display(), locations = locations.len(), "container store ready");
        Ok(Self {
            datastore,
            locations,
            writer: ContainerWriter::new(options),
            pool,
            limiter: Arc::new(ThroughputLimiter::unlimited()),
            gate: RwLock::new(()),
            open_containers: Mutex::new(HashMap::new()),
        })
    }

    /// Throttle extraction with `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<ThroughputLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    /// Path of a container file on any storage location.
    fn locate(&self, name: &str) -> Option<PathBuf> {
        self.locations
            .iter()
            .map(|location| location.join(name))
            .find(|path| path.is_file())
    }

    /// All index entries for `hash` as `(container name, record)`.
    fn index_entries(&self, hash: &ContentHash) -> Result<Vec<(String, EntryRecord)>> {
        let prefix = format!("{}{}/", CONTENT_PREFIX, hash.to_hex());
        self.datastore
            .scan_json::<IndexRecord>(&prefix)?
            .into_iter()
            .filter_map(|(key, record)| {
                let (_, name) = parse_index_key(&key)?;
                Some((name.to_string(), record))
            })
            .map(|(name, record)| {
                let entry = EntryRecord::from_hex(&record.entry, Path::new(&name))?;
                Ok((name, entry))
            })
            .collect()
    }

    /// First index entry whose container still exists.
    fn resolve(&self, hash: &ContentHash) -> Result<Option<(PathBuf, EntryRecord)>> {
        for (name, entry) in self.index_entries(hash)? {
            if let Some(path) = self.locate(&name) {
                return Ok(Some((path, entry)));
            }
        }
        Ok(None)
    }

    fn open_container(&self, path: &Path) -> Result<Arc<Container>> {
        if let Some(container) = self.open_containers.lock()?.get(path) {
            return Ok(Arc::clone(container));
        }
        let container = Arc::new(Container::open(path)?);
        self.open_containers
            .lock()?
            .insert(path.to_path_buf(), Arc::clone(&container));
        Ok(container)
    }

    fn forget_container(&self, path: &Path) -> Result<()> {
        self.open_containers.lock()?.remove(path);
        Ok(())
    }

    /// Containers present on disk: `(name, path)` for finished files and temp files separately.
    fn list_files(&self) -> Result<(Vec<(String, PathBuf)>, Vec<PathBuf>)> {
        let mut containers = Vec::new();
        let mut temps = Vec::new();
        for location in &self.locations {
            if !location.exists() {
                continue;
            }
            for entry in fs::read_dir(location)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let extension = path.extension().and_then(|e| e.to_str());
                if extension == Some(TEMP_EXTENSION) {
                    temps.push(path);
                } else if extension == Some(CONTAINER_EXTENSION)
                    && let Some(name) = path.file_name().and_then(|n| n.to_str())
                {
                    containers.push((name.to_string(), path.clone()));
                }
            }
        }
        Ok((containers, temps))
    }
}

impl ContentStore for ContainerStore {
    fn backend_name(&self) -> &'static str {
        "container"
    }

    fn have_file(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.resolve(hash)?.is_some())
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
        let mut new_entries = Vec::new();
        for entry in entries {
            if seen.insert(entry.hash) && !self.have_file(&entry.hash)? {
                new_entries.push(entry);
            }
        }
        let skipped = offered - new_entries.len();
        if new_entries.is_empty() {
            tracing::debug!(skipped, "nothing new to back up");
            return Ok(BackupReport {
                container: None,
                stored: Vec::new(),
                skipped,
            });
        }

        let name = format!("{}.{}", Uuid::new_v4().simple(), CONTAINER_EXTENSION);
        let path = self.locations[0].join(&name);
        let packed = self.writer.pack(&path, &new_entries, cancel)?;

        let mut tx = Transaction::new();
        for entry in &packed.entries {
            tx.assert_json(
                index_key(&entry.hash, &name),
                &IndexRecord {
                    entry: entry.to_hex(),
                },
            )?;
        }
        if let Err(err) = self.datastore.commit(tx) {
            // Uncommitted containers are unreachable; drop it now instead of waiting for GC
            let _ = fs::remove_file(&path);
            return Err(err);
        }

        tracing::info!(
            container = %name,
            stored = packed.entries.len(),
            skipped,
            bytes = packed.total_size,
            "backed up files"
        );
        Ok(BackupReport {
            container: Some(name),
            stored: packed.entries.iter().map(|e| e.hash).collect(),
            skipped,
        })
    }

    fn get_file_stream(&self, hash: &ContentHash) -> Result<FileStream> {
        let (path, _) = self
            .resolve(hash)?
            .ok_or_else(|| Error::missing_content(hash.to_hex()))?;
        let container = self.open_container(&path)?;
        Ok(Box::new(container.open_entry(hash)?.into_reader()))
    }

    fn extract_files(&self, requests: &[ExtractRequest], cancel: &CancellationToken) -> Result<()> {
        // Resolve everything before touching the filesystem
        let mut groups: BTreeMap<PathBuf, Vec<&ExtractRequest>> = BTreeMap::new();
        for request in requests {
            let (path, _) = self
                .resolve(&request.hash)?
                .ok_or_else(|| Error::missing_content(request.hash.to_hex()))?;
            groups.entry(path).or_default().push(request);
        }
        tracing::debug!(
            files = requests.len(),
            containers = groups.len(),
            "extracting files"
        );

        self.pool.install(|| {
            groups.par_iter().try_for_each(|(path, requests)| -> Result<()> {
                let container = self.open_container(path)?;
                for request in requests {
                    let mut reader = container.open_entry(&request.hash)?.into_reader();
                    write_stream_atomic(&request.destination, &mut reader, cancel, &self.limiter)?;
                }
                Ok(())
            })
        })
    }

    fn get_file_hashes(&self) -> Result<HashSet<ContentHash>> {
        Ok(self
            .datastore
            .scan_prefix(CONTENT_PREFIX, None)?
            .into_iter()
            .filter_map(|(key, _)| parse_index_key(&key).map(|(hash, _)| hash))
            .collect())
    }

    fn sweep(&self, reachable: &Reachable<'_>, dry_run: bool) -> Result<GcStats> {
        let _gate = self.gate.write()?;
        let reachable = reachable()?;
        let mut stats = GcStats::default();

        // Group index keys by container
        let mut by_container: BTreeMap<String, Vec<(String, ContentHash)>> = BTreeMap::new();
        for (key, _) in self.datastore.scan_prefix(CONTENT_PREFIX, None)? {
            if let Some((hash, name)) = parse_index_key(&key) {
                by_container
                    .entry(name.to_string())
                    .or_default()
                    .push((key.clone(), hash));
            }
        }

        let mut tx = Transaction::new();
        let mut doomed = Vec::new();
        for (name, keys) in &by_container {
            let path = self.locate(name);
            let dead = path.is_none() || keys.iter().all(|(_, hash)| !reachable.contains(hash));
            if !dead {
                continue;
            }
            for (key, _) in keys {
                tx.retract(key.clone());
            }
            stats.entries_retracted += keys.len();
            if let Some(path) = path {
                doomed.push(path);
            }
        }

        // Containers that never got their index committed
        let (files, temps) = self.list_files()?;
        for (name, path) in files {
            if !by_container.contains_key(&name) {
                tracing::warn!(container = %name, "removing unindexed container");
                doomed.push(path);
            }
        }

        if !dry_run {
            self.datastore.commit(tx)?;
        }

        for path in doomed {
            stats.bytes_freed += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            stats.containers_deleted += 1;
            if !dry_run {
                self.forget_container(&path)?;
                fs::remove_file(&path)?;
            }
            tracing::debug!(path = %path.display(), dry_run, "deleted container");
        }

        // No backup can be in flight while the gate is held exclusively
        for path in temps {
            tracing::warn!(path = %path.display(), "removing stale temporary container");
            stats.bytes_freed += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            stats.stale_temp_files += 1;
            if !dry_run {
                fs::remove_file(&path)?;
            }
        }

        Ok(stats)
    }
}
