//! Apply loadouts to game installations and ingest changes back.
//!
//! A [`Synchronizer`] owns the worker pool and throughput limiter used for
//! hashing and ties the datastore, content store and hash cache together.
//! Operations on one installation are serialized; garbage collection waits
//! for all of them.

use crate::config::Config;
use crate::datastore::{Datastore, FileDatastore, Transaction};
use crate::disk_state::{DiskState, DiskStates};
use crate::error::{Error, Result};
use crate::flatten::{FlattenedLoadout, flatten_for};
use crate::game::{GameInstallation, GamePath, LocationId};
use crate::gc::{self, GcStats};
use crate::hash::ContentHash;
use crate::hash_cache::{HashCache, modified_nanos};
use crate::import::{ImportReport, import_directory};
use crate::loadout::{Loadout, Loadouts, OverrideChange};
use crate::scan::scan_installation;
use crate::store::{self, BackupEntry, BackupReport, ContentStore, ExtractRequest, StreamSource};
use crate::sync_state::{Action, ApplyPlan, IngestPlan, PlanMode, SyncTree};
use crate::throttle::{CancellationToken, ThroughputLimiter};
use rayon::ThreadPool;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub installation: String,
    pub generation: u64,
    pub files: usize,
    pub bytes: u64,
    /// Files whose content was not yet archived.
    pub stored: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub loadout: String,
    pub generation: u64,
    pub backed_up: usize,
    pub deleted: usize,
    pub extracted: usize,
    pub adopted: usize,
    pub removed_dirs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub loadout: String,
    pub generation: u64,
    pub revision: u64,
    pub backed_up: usize,
    pub created: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Present when apply hit a conflict and disk changes were ingested first.
    pub ingested: Option<IngestReport>,
    pub applied: ApplyReport,
}

pub struct Synchronizer {
    config: Config,
    datastore: Arc<dyn Datastore>,
    store: Arc<dyn ContentStore>,
    hash_cache: Arc<HashCache>,
    pool: Arc<ThreadPool>,
    limiter: Arc<ThroughputLimiter>,
    installations: BTreeMap<String, GameInstallation>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // Shared by apply/ingest/index, exclusive for gc
    gate: RwLock<()>,
    cancel: CancellationToken,
}

impl Synchronizer {
    pub fn new(
        config: Config,
        datastore: Arc<dyn Datastore>,
        store: Arc<dyn ContentStore>,
        hash_cache: Arc<HashCache>,
    ) -> Result<Self> {
        let limiter = Arc::new(ThroughputLimiter::new(config.workers.max_bytes_per_sec));
        Self::with_limiter(config, datastore, store, hash_cache, limiter)
    }

    /// Like [`new`](Self::new), sharing `limiter` with the content store.
    pub fn with_limiter(
        config: Config,
        datastore: Arc<dyn Datastore>,
        store: Arc<dyn ContentStore>,
        hash_cache: Arc<HashCache>,
        limiter: Arc<ThroughputLimiter>,
    ) -> Result<Self> {
        let pool = Arc::new(build_pool(&config, "loadkeep-hash")?);
        let installations = config
            .installations
            .iter()
            .map(|c| Ok((c.id.clone(), GameInstallation::from_config(c)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            config,
            datastore,
            store,
            hash_cache,
            pool,
            limiter,
            installations,
            locks: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
            cancel: CancellationToken::new(),
        })
    }

    /// Open the datastore, hash cache and content store described by `config`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let datastore: Arc<dyn Datastore> = Arc::new(FileDatastore::open(config.datastore_path())?);
        let hash_cache = Arc::new(HashCache::open(config.hash_cache_path())?);
        let store_pool = Arc::new(build_pool(&config, "loadkeep-extract")?);
        // Hashing and extraction draw from one budget
        let limiter = Arc::new(ThroughputLimiter::new(config.workers.max_bytes_per_sec));
        let store = store::open_store(
            &config,
            Arc::clone(&datastore),
            store_pool,
            Arc::clone(&limiter),
        )?;
        Self::with_limiter(config, datastore, store, hash_cache, limiter)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn hash_cache(&self) -> &Arc<HashCache> {
        &self.hash_cache
    }

    /// Token that cancels hashing, packing and extraction in progress.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn loadouts(&self) -> Loadouts<'_> {
        Loadouts::new(self.datastore.as_ref())
    }

    pub fn disk_states(&self) -> DiskStates<'_> {
        DiskStates::new(self.datastore.as_ref())
    }

    pub fn installation(&self, id: &str) -> Result<&GameInstallation> {
        self.installations
            .get(id)
            .ok_or_else(|| Error::unknown_item("installation", id))
    }

    pub fn installations(&self) -> impl Iterator<Item = &GameInstallation> {
        self.installations.values()
    }

    fn installation_lock(&self, id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock()?;
        Ok(Arc::clone(locks.entry(id.to_string()).or_default()))
    }

    /// Hash the current contents of an installation.
    pub fn scan(&self, installation: &GameInstallation) -> Result<DiskState> {
        scan_installation(
            installation,
            &self.hash_cache,
            Arc::clone(&self.pool),
            Arc::clone(&self.limiter),
            &self.cancel,
            self.config.scan.fail_fast,
        )
    }

    /// Hashes of disk and loadout content that the store already holds.
    fn archived(&self, disk: &DiskState, flat: &FlattenedLoadout) -> Result<HashSet<ContentHash>> {
        let candidates: HashSet<ContentHash> = disk
            .entries
            .values()
            .map(|e| e.hash)
            .chain(flat.files().values().map(|f| f.hash))
            .collect();
        let mut archived = HashSet::with_capacity(candidates.len());
        for hash in candidates {
            if self.store.have_file(&hash)? {
                archived.insert(hash);
            }
        }
        Ok(archived)
    }

    /// Back up the disk content named by `BackupFile` actions in one call.
    fn run_backups(&self, installation: &GameInstallation, actions: &[Action]) -> Result<usize> {
        let entries = actions
            .iter()
            .filter_map(|action| match action {
                Action::BackupFile { path, hash, size } => Some((path, *hash, *size)),
                _ => None,
            })
            .map(|(path, hash, size)| {
                let abs = installation.to_absolute(path)?;
                Ok(BackupEntry::new(StreamSource::Path(abs), hash, size))
            })
            .collect::<Result<Vec<_>>>()?;
        if entries.is_empty() {
            return Ok(0);
        }
        Ok(self.store.backup_files(entries, &self.cancel)?.stored.len())
    }

    /// Record the bare game: scan, archive everything, store a snapshot.
    pub fn index_game(&self, installation_id: &str) -> Result<IndexReport> {
        let installation = self.installation(installation_id)?;
        let _span = tracing::info_span!("index", installation = installation_id).entered();
        let _gate = self.gate.read()?;
        let lock = self.installation_lock(installation_id)?;
        let _guard = lock.lock()?;

        let mut state = self.scan(installation)?;
        let entries = state
            .entries
            .iter()
            .map(|(path, entry)| {
                let abs = installation.to_absolute(path)?;
                Ok(BackupEntry::new(StreamSource::Path(abs), entry.hash, entry.size))
            })
            .collect::<Result<Vec<_>>>()?;
        let backup = self.store.backup_files(entries, &self.cancel)?;

        let mut tx = Transaction::new();
        self.disk_states().put(&mut tx, &mut state)?;
        self.datastore.commit(tx)?;
        self.flush_hash_cache();

        let report = IndexReport {
            installation: installation_id.to_string(),
            generation: state.generation,
            files: state.entries.len(),
            bytes: state.total_size(),
            stored: backup.stored.len(),
        };
        tracing::info!(
            files = report.files,
            bytes = report.bytes,
            stored = report.stored,
            generation = report.generation,
            "indexed installation"
        );
        Ok(report)
    }

    /// Store files directly, outside any loadout.
    ///
    /// Runs under the shared gate so a concurrent [`gc`](Self::gc) cannot
    /// sweep the container between packing and indexing.
    pub fn backup_files(&self, entries: Vec<BackupEntry>) -> Result<BackupReport> {
        let _gate = self.gate.read()?;
        self.store.backup_files(entries, &self.cancel)
    }

    /// Import a mod directory as a new group and save the loadout.
    ///
    /// The archived content and the loadout referencing it become visible
    /// to [`gc`](Self::gc) together.
    pub fn import_mod(
        &self,
        loadout: &mut Loadout,
        group_name: &str,
        dir: &Path,
        location: &LocationId,
    ) -> Result<ImportReport> {
        let _span = tracing::info_span!("import", loadout = %loadout.name, group = group_name).entered();
        let _gate = self.gate.read()?;
        let report = import_directory(self.store.as_ref(), loadout, group_name, dir, location, &self.cancel)?;
        self.loadouts().save(loadout)?;
        Ok(report)
    }

    /// New loadout holding the installation's initially indexed files.
    pub fn create_loadout(&self, name: &str, installation_id: &str) -> Result<Loadout> {
        self.installation(installation_id)?;
        let initial = self
            .disk_states()
            .initial(installation_id)?
            .ok_or_else(|| Error::no_disk_state(installation_id))?;

        let mut loadout = Loadout::new(name, installation_id);
        loadout.game_files_group();
        for (path, entry) in initial.entries {
            loadout.add_game_file(path, entry.hash, entry.size);
        }
        self.loadouts().save(&mut loadout)?;
        tracing::info!(loadout = %loadout.id, name, files = loadout.files().len(), "created loadout");
        Ok(loadout)
    }

    fn compute_apply(
        &self,
        installation: &GameInstallation,
        loadout: &Loadout,
    ) -> Result<(ApplyPlan, DiskState)> {
        let flat = flatten_for(loadout, installation)?;
        let disk = self.scan(installation)?;
        let prev = self.disk_states().latest(installation.id())?;
        let archived = self.archived(&disk, &flat)?;
        let tree = SyncTree::build(installation, &disk, prev.as_ref(), &flat, &archived, PlanMode::Apply);
        tracing::debug!(summary = ?tree.summary(), "classified paths for apply");
        let plan = ApplyPlan::from_tree(installation.id(), &tree)?;
        Ok((plan, disk))
    }

    /// The steps [`apply`](Self::apply) would run, without running them.
    pub fn plan_apply(&self, loadout: &Loadout) -> Result<ApplyPlan> {
        let installation = self.installation(&loadout.installation)?;
        let lock = self.installation_lock(installation.id())?;
        let _guard = lock.lock()?;
        Ok(self.compute_apply(installation, loadout)?.0)
    }

    /// Make disk match the loadout.
    ///
    /// Fails with [`Error::ConflictRequiresIngest`] before touching anything
    /// if disk changed since the last snapshot. The new snapshot is written
    /// only after every step succeeded.
    pub fn apply(&self, loadout: &Loadout) -> Result<ApplyReport> {
        let installation = self.installation(&loadout.installation)?;
        let _span = tracing::info_span!("apply", loadout = %loadout.name, installation = installation.id())
            .entered();
        let _gate = self.gate.read()?;
        let lock = self.installation_lock(installation.id())?;
        let _guard = lock.lock()?;

        let (plan, disk) = self.compute_apply(installation, loadout)?;
        if plan.has_conflicts() {
            return Err(Error::conflict_requires_ingest(
                installation.id(),
                plan.conflicts.iter().map(ToString::to_string).collect(),
            ));
        }

        let mut report = ApplyReport {
            loadout: loadout.id.clone(),
            adopted: plan.adopted.len(),
            ..ApplyReport::default()
        };
        report.backed_up = self.run_backups(installation, &plan.actions)?;

        // Deletes, then empty parent directories deepest first
        let mut dirs: BTreeSet<(Reverse<usize>, GamePath)> = BTreeSet::new();
        for action in &plan.actions {
            let Action::DeleteFile { path, .. } = action else {
                continue;
            };
            self.cancel.check()?;
            let abs = installation.to_absolute(path)?;
            match fs::remove_file(&abs) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(path = %path, "deleted file");
            report.deleted += 1;
            for parent in path.parents() {
                let dir = GamePath::new(path.location().clone(), parent)?;
                dirs.insert((Reverse(parent.split('/').count()), dir));
            }
        }
        report.removed_dirs = remove_empty_dirs(installation, dirs.into_iter().map(|(_, d)| d))?;

        let extracts: Vec<(&GamePath, ExtractRequest)> = plan
            .actions
            .iter()
            .filter_map(|action| match action {
                Action::ExtractFile { path, hash, .. } => Some((path, *hash)),
                _ => None,
            })
            .map(|(path, hash)| Ok((path, ExtractRequest::new(hash, installation.to_absolute(path)?))))
            .collect::<Result<_>>()?;
        if !extracts.is_empty() {
            let requests: Vec<ExtractRequest> = extracts.iter().map(|(_, r)| r.clone()).collect();
            self.store.extract_files(&requests, &self.cancel)?;
        }
        report.extracted = extracts.len();

        let extracted: HashMap<&GamePath, &ExtractRequest> =
            extracts.iter().map(|(path, request)| (*path, request)).collect();
        let mut state = DiskState::new(installation.id());
        for (path, mut entry) in plan.expected {
            if let Some(request) = extracted.get(&path) {
                let metadata = fs::metadata(&request.destination)?;
                entry.modified_nanos = modified_nanos(&metadata)?;
                self.hash_cache
                    .record(&request.destination, entry.hash, entry.size, entry.modified_nanos)?;
            } else if let Some(on_disk) = disk.entries.get(&path) {
                entry.modified_nanos = on_disk.modified_nanos;
            }
            state.entries.insert(path, entry);
        }

        let mut tx = Transaction::new();
        self.disk_states().put(&mut tx, &mut state)?;
        self.datastore.commit(tx)?;
        self.flush_hash_cache();
        report.generation = state.generation;

        tracing::info!(
            backed_up = report.backed_up,
            deleted = report.deleted,
            extracted = report.extracted,
            adopted = report.adopted,
            removed_dirs = report.removed_dirs,
            generation = report.generation,
            "applied loadout"
        );
        Ok(report)
    }

    fn compute_ingest(&self, installation: &GameInstallation, loadout: &Loadout) -> Result<IngestPlan> {
        let prev = self
            .disk_states()
            .latest(installation.id())?
            .ok_or_else(|| Error::no_disk_state(installation.id()))?;
        let flat = flatten_for(loadout, installation)?;
        let disk = self.scan(installation)?;
        let archived = self.archived(&disk, &flat)?;
        let tree = SyncTree::build(installation, &disk, Some(&prev), &flat, &archived, PlanMode::Ingest);
        tracing::debug!(summary = ?tree.summary(), "classified paths for ingest");
        Ok(IngestPlan::from_tree(installation.id(), &tree))
    }

    /// The changes [`ingest`](Self::ingest) would record.
    pub fn plan_ingest(&self, loadout: &Loadout) -> Result<IngestPlan> {
        let installation = self.installation(&loadout.installation)?;
        let lock = self.installation_lock(installation.id())?;
        let _guard = lock.lock()?;
        self.compute_ingest(installation, loadout)
    }

    /// Record disk changes since the last snapshot in the overrides group.
    ///
    /// The loadout and the new snapshot are committed together.
    pub fn ingest(&self, loadout: &mut Loadout) -> Result<IngestReport> {
        let installation = self.installation(&loadout.installation)?;
        let _span = tracing::info_span!("ingest", loadout = %loadout.name, installation = installation.id())
            .entered();
        let _gate = self.gate.read()?;
        let lock = self.installation_lock(installation.id())?;
        let _guard = lock.lock()?;

        let plan = self.compute_ingest(installation, loadout)?;
        let mut report = IngestReport {
            loadout: loadout.id.clone(),
            ..IngestReport::default()
        };
        report.backed_up = self.run_backups(installation, &plan.actions)?;

        for action in &plan.actions {
            match action {
                Action::CreateInLoadout { path, hash, size } => {
                    loadout.set_override(
                        path.clone(),
                        OverrideChange::Content {
                            hash: *hash,
                            size: *size,
                        },
                    );
                    report.created += 1;
                }
                Action::RemoveFromLoadout { path } => {
                    loadout.set_override(path.clone(), OverrideChange::Removed);
                    report.removed += 1;
                }
                Action::BackupFile { .. } | Action::DeleteFile { .. } | Action::ExtractFile { .. } => {}
            }
        }

        let mut state = DiskState::new(installation.id());
        state.entries = plan.expected;
        let mut tx = Transaction::new();
        if report.created + report.removed > 0 {
            self.loadouts().put(&mut tx, loadout)?;
        }
        self.disk_states().put(&mut tx, &mut state)?;
        self.datastore.commit(tx)?;
        self.flush_hash_cache();
        report.generation = state.generation;
        report.revision = loadout.revision;

        tracing::info!(
            backed_up = report.backed_up,
            created = report.created,
            removed = report.removed,
            generation = report.generation,
            "ingested changes"
        );
        Ok(report)
    }

    /// Apply; on a conflict ingest first and apply again.
    pub fn synchronize(&self, loadout: &mut Loadout) -> Result<SyncReport> {
        match self.apply(loadout) {
            Ok(applied) => Ok(SyncReport {
                ingested: None,
                applied,
            }),
            Err(e) if e.is_conflict() => {
                tracing::info!(error = %e, "ingesting before apply");
                let ingested = self.ingest(loadout)?;
                let applied = self.apply(loadout)?;
                Ok(SyncReport {
                    ingested: Some(ingested),
                    applied,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Delete stored content no loadout or snapshot references.
    pub fn gc(&self, dry_run: bool) -> Result<GcStats> {
        let _gate = self.gate.write()?;
        gc::collect_garbage(self.datastore.as_ref(), self.store.as_ref(), dry_run)
    }

    fn flush_hash_cache(&self) {
        if let Err(e) = self.hash_cache.flush() {
            tracing::warn!(error = %e, "failed to persist hash cache");
        }
    }
}

fn build_pool(config: &Config, name: &'static str) -> Result<ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads())
        .thread_name(move |i| format!("{}-{}", name, i))
        .build()?)
}

/// Remove directories that became empty, in the given (deepest first) order.
///
/// Location roots are never removed.
fn remove_empty_dirs(
    installation: &GameInstallation,
    dirs: impl Iterator<Item = GamePath>,
) -> Result<usize> {
    let mut removed = 0;
    for dir in dirs {
        let abs = installation.to_absolute(&dir)?;
        if installation.is_root(&abs) {
            continue;
        }
        match fs::remove_dir(&abs) {
            Ok(()) => removed += 1,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) => {}
            Err(e) => {
                tracing::warn!(path = %abs.display(), error = %e, "could not remove directory");
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallationConfig;
    use crate::loadout::GroupKind;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        game: PathBuf,
        sync: Synchronizer,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let game = temp.path().join("game");
        fs::create_dir_all(game.join("Data")).unwrap();
        fs::write(game.join("Game.exe"), b"exe").unwrap();
        fs::write(game.join("Data/Base.esm"), b"base").unwrap();

        let config = Config {
            data_dir: temp.path().join("data"),
            storage_locations: vec![temp.path().join("archives")],
            installations: vec![InstallationConfig {
                id: "test".into(),
                locations: BTreeMap::from([("game".to_string(), game.clone())]),
                ignore: Vec::new(),
            }],
            ..Config::default()
        };
        let sync = Synchronizer::open(config).unwrap();
        Fixture {
            _temp: temp,
            game,
            sync,
        }
    }

    fn add_mod(sync: &Synchronizer, loadout: &mut Loadout, name: &str, files: &[(&str, &[u8])]) {
        let entries: Vec<BackupEntry> = files
            .iter()
            .map(|(_, data)| BackupEntry::from_bytes(data.to_vec()))
            .collect();
        let hashes: Vec<(ContentHash, u64)> = entries.iter().map(|e| (e.hash, e.size)).collect();
        sync.store().backup_files(entries, &CancellationToken::new()).unwrap();

        let mods = loadout.mods_collection();
        let group = loadout.add_group(mods, name, GroupKind::Mod).unwrap();
        let item = loadout.add_item(group, name).unwrap();
        for ((target, _), (hash, size)) in files.iter().zip(hashes) {
            loadout
                .add_file(item, GamePath::parse(target).unwrap(), hash, size)
                .unwrap();
        }
    }

    #[test]
    fn test_index_and_create_loadout() {
        let fx = fixture();
        assert!(fx.sync.create_loadout("main", "test").unwrap_err().to_string().contains("test"));

        let report = fx.sync.index_game("test").unwrap();
        assert_eq!(report.generation, 0);
        assert_eq!(report.files, 2);
        assert_eq!(report.stored, 2);

        let loadout = fx.sync.create_loadout("main", "test").unwrap();
        assert_eq!(loadout.files().len(), 2);
        assert!(fx.sync.plan_apply(&loadout).unwrap().is_empty());
        assert!(fx.sync.index_game("nope").is_err());
    }

    #[test]
    fn test_apply_removes_empty_dirs_but_not_roots() {
        let fx = fixture();
        fx.sync.index_game("test").unwrap();
        let mut loadout = fx.sync.create_loadout("main", "test").unwrap();
        add_mod(&fx.sync, &mut loadout, "deep", &[("game/Data/a/b/c/deep.txt", b"deep")]);
        fx.sync.apply(&loadout).unwrap();
        assert_eq!(fs::read(fx.game.join("Data/a/b/c/deep.txt")).unwrap(), b"deep");

        let group = loadout.find_group("deep").unwrap();
        loadout.remove_groups(&[group]).unwrap();
        let report = fx.sync.apply(&loadout).unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.removed_dirs, 3);
        assert!(!fx.game.join("Data/a").exists());
        assert!(fx.game.join("Data/Base.esm").exists());
    }

    #[test]
    fn test_remove_empty_dirs_keeps_roots() {
        let fx = fixture();
        let installation = fx.sync.installation("test").unwrap();
        fs::create_dir_all(fx.game.join("empty/nested")).unwrap();
        let dirs = ["game/empty/nested", "game/empty", "game/Data"]
            .into_iter()
            .map(|d| GamePath::parse(d).unwrap());
        assert_eq!(remove_empty_dirs(installation, dirs).unwrap(), 2);
        assert!(!fx.game.join("empty").exists());
        assert!(fx.game.join("Data").exists());

        fs::remove_file(fx.game.join("Game.exe")).unwrap();
        fs::remove_file(fx.game.join("Data/Base.esm")).unwrap();
        let dirs = ["game/Data"].into_iter().map(|d| GamePath::parse(d).unwrap());
        assert_eq!(remove_empty_dirs(installation, dirs).unwrap(), 1);
        assert!(fx.game.exists());
    }

    #[test]
    fn test_conflict_leaves_disk_and_snapshot_untouched() {
        let fx = fixture();
        fx.sync.index_game("test").unwrap();
        let mut loadout = fx.sync.create_loadout("main", "test").unwrap();
        add_mod(&fx.sync, &mut loadout, "m", &[("game/mod.txt", b"mod")]);

        fs::write(fx.game.join("Game.exe"), b"patched by user").unwrap();
        let err = fx.sync.apply(&loadout).unwrap_err();
        assert!(err.is_conflict());
        assert!(!fx.game.join("mod.txt").exists());
        assert_eq!(fx.sync.disk_states().history("test").unwrap().len(), 1);

        let report = fx.sync.synchronize(&mut loadout).unwrap();
        let ingested = report.ingested.unwrap();
        assert_eq!(ingested.created, 1);
        assert_eq!(report.applied.extracted, 1);
        assert_eq!(fs::read(fx.game.join("Game.exe")).unwrap(), b"patched by user");
        assert_eq!(fs::read(fx.game.join("mod.txt")).unwrap(), b"mod");
    }

    #[test]
    fn test_ingest_requires_snapshot() {
        let fx = fixture();
        let mut loadout = Loadout::new("main", "test");
        let err = fx.sync.ingest(&mut loadout).unwrap_err();
        assert!(matches!(err, Error::NoDiskState { .. }));
    }

    #[test]
    fn test_apply_seeds_hash_cache() {
        let fx = fixture();
        fx.sync.index_game("test").unwrap();
        let mut loadout = fx.sync.create_loadout("main", "test").unwrap();
        add_mod(&fx.sync, &mut loadout, "m", &[("game/seeded.txt", b"seeded")]);
        fx.sync.apply(&loadout).unwrap();

        let cached = fx
            .sync
            .hash_cache()
            .lookup(&fx.game.join("seeded.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(cached.hash, ContentHash::hash_bytes(b"seeded"));
    }
}
