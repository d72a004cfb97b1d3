//! # Loadkeep Core
//!
//! A loadout synchronization engine for game mods, backed by a
//! deduplicating, chunked content store using BLAKE3 hashing.
//!
//! A loadout describes which files a game installation should contain.
//! The engine compares the disk, the last recorded disk state and the
//! loadout, then deploys, removes or ingests files so the three agree.
//! Every file it touches is archived first, so nothing is lost.
//!
//! ## Features
//!
//! - Content-addressed storage in chunked, compressed containers
//! - Random-access reads of single files inside a container
//! - Path/size/mtime hash cache for fast rescans
//! - Rule-based mod ordering with dense conflict priorities
//! - Three-way apply/ingest with conflict detection
//! - Whole-container garbage collection
//!
//! ## Example
//!
//! ```no_run
//! use loadkeep_core::{Config, Synchronizer};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(Path::new("loadkeep.toml"))?;
//! let sync = Synchronizer::open(config)?;
//!
//! // Record the unmodified game, then build a loadout on top of it
//! sync.index_game("skyrim")?;
//! let mut loadout = sync.create_loadout("Main", "skyrim")?;
//!
//! // Deploy; changes made on disk since the last run are ingested first
//! let report = sync.synchronize(&mut loadout)?;
//! println!("Extracted {} files", report.applied.extracted);
//!
//! // Reclaim space from content nothing references any more
//! let stats = sync.gc(false)?;
//! println!("Deleted {} containers", stats.containers_deleted);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod container;
pub mod datastore;
mod disk_state;
mod error;
mod flatten;
mod game;
mod gc;
mod hash;
mod hash_cache;
mod import;
mod loadout;
mod scan;
mod sort;
pub mod store;
mod sync_state;
mod synchronizer;
mod throttle;

pub use config::{Backend, Config, InstallationConfig};
pub use datastore::{Datastore, DatastoreExt, FileDatastore, MemoryDatastore, Transaction};
pub use disk_state::{DiskState, DiskStateEntry, DiskStates};
pub use error::{Error, Result};
pub use flatten::{FlattenedFile, FlattenedLoadout, flatten, flatten_for};
pub use game::{GameInstallation, GamePath, LocationId};
pub use gc::{GcStats, collect_garbage, reachable_hashes};
pub use hash::{ContentHash, HASH_SIZE};
pub use hash_cache::{FolderHashes, HashCache, HashFailure, HashedFile};
pub use import::{ImportReport, import_directory};
pub use loadout::{
    Collection, CollectionId, ConflictPriority, FileId, Group, GroupId, GroupKind, Item, ItemId,
    Loadout, LoadoutFile, Loadouts, Node, OverrideChange, Placement,
};
pub use scan::scan_installation;
pub use sort::{SortRule, sort_by_rules};
pub use store::{BackupEntry, BackupReport, ContentStore, ExtractRequest, StreamSource};
pub use sync_state::{
    Action, ApplyPlan, Classification, IngestPlan, PlanMode, Signature, SyncNode, SyncTree,
};
pub use synchronizer::{ApplyReport, IndexReport, IngestReport, SyncReport, Synchronizer};
pub use throttle::{CancellationToken, ThroughputLimiter};
