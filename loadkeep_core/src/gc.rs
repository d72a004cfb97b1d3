//! Garbage collection of stored content.
//!
//! Reachability is computed from every loadout and every disk state
//! snapshot in the datastore; the store then deletes whatever it holds
//! that is not reachable. Containers are collected whole.

use crate::datastore::Datastore;
use crate::disk_state::DiskStates;
use crate::error::Result;
use crate::hash::ContentHash;
use crate::loadout::Loadouts;
use crate::store::ContentStore;
use serde::Serialize;
use std::cell::Cell;
use std::collections::HashSet;

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Container (or object) files deleted.
    pub containers_deleted: usize,
    /// Index entries retracted from the datastore.
    pub entries_retracted: usize,
    /// Bytes freed on disk.
    pub bytes_freed: u64,
    /// Leftover temporary files from interrupted packs.
    pub stale_temp_files: usize,
}

/// Hashes referenced by any loadout file or any disk state snapshot.
pub fn reachable_hashes(datastore: &dyn Datastore) -> Result<HashSet<ContentHash>> {
    let mut reachable = DiskStates::new(datastore).all_hashes()?;
    for loadout in Loadouts::new(datastore).list()? {
        reachable.extend(loadout.all_hashes());
    }
    Ok(reachable)
}

/// Run garbage collection: sweep the store, computing reachability once
/// the store has shut out new backups.
///
/// When `dry_run` is set nothing is deleted and the stats describe what
/// would have been.
pub fn collect_garbage(
    datastore: &dyn Datastore,
    store: &dyn ContentStore,
    dry_run: bool,
) -> Result<GcStats> {
    let _span = tracing::info_span!("gc", backend = store.backend_name(), dry_run).entered();

    let reachable_count = Cell::new(0);
    let stats = store.sweep(
        &|| {
            let reachable = reachable_hashes(datastore)?;
            reachable_count.set(reachable.len());
            Ok(reachable)
        },
        dry_run,
    )?;

    tracing::info!(
        reachable = reachable_count.get(),
        containers_deleted = stats.containers_deleted,
        entries_retracted = stats.entries_retracted,
        bytes_freed = stats.bytes_freed,
        stale_temp_files = stats.stale_temp_files,
        "garbage collection finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::PackOptions;
    use crate::datastore::{MemoryDatastore, Transaction};
    use crate::disk_state::{DiskState, DiskStateEntry};
    use crate::game::GamePath;
    use crate::loadout::{GroupKind, Loadout};
    use crate::store::{BackupEntry, ContainerStore};
    use crate::throttle::CancellationToken;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MemoryDatastore>, ContainerStore) {
        let temp = TempDir::new().unwrap();
        let datastore = Arc::new(MemoryDatastore::new());
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let store = ContainerStore::new(
            Arc::clone(&datastore) as Arc<dyn Datastore>,
            vec![temp.path().join("archives")],
            PackOptions::default(),
            pool,
        )
        .unwrap();
        (temp, datastore, store)
    }

    fn backup(store: &ContainerStore, content: &[u8]) -> ContentHash {
        let entry = BackupEntry::from_bytes(content.to_vec());
        let hash = entry.hash;
        store.backup_files(vec![entry], &CancellationToken::new()).unwrap();
        hash
    }

    #[test]
    fn test_reachable_from_loadouts_and_snapshots() {
        let (_temp, datastore, _store) = setup();
        let in_loadout = ContentHash::hash_bytes(b"loadout");
        let in_snapshot = ContentHash::hash_bytes(b"snapshot");

        let mut loadout = Loadout::new("l", "game");
        let mods = loadout.mods_collection();
        let group = loadout.add_group(mods, "m", GroupKind::Mod).unwrap();
        let item = loadout.add_item(group, "m").unwrap();
        loadout
            .add_file(item, GamePath::parse("game/a").unwrap(), in_loadout, 7)
            .unwrap();
        Loadouts::new(datastore.as_ref()).save(&mut loadout).unwrap();

        let mut state = DiskState::new("game");
        state.entries.insert(
            GamePath::parse("game/b").unwrap(),
            DiskStateEntry {
                hash: in_snapshot,
                size: 8,
                modified_nanos: 0,
            },
        );
        let mut tx = Transaction::new();
        DiskStates::new(datastore.as_ref()).put(&mut tx, &mut state).unwrap();
        datastore.commit(tx).unwrap();

        let reachable = reachable_hashes(datastore.as_ref()).unwrap();
        assert_eq!(reachable, HashSet::from([in_loadout, in_snapshot]));
    }

    #[test]
    fn test_collect_keeps_referenced_content() {
        let (_temp, datastore, store) = setup();
        let kept = backup(&store, b"kept content");
        let dropped = backup(&store, b"dropped content");

        let mut state = DiskState::new("game");
        state.entries.insert(
            GamePath::parse("game/kept").unwrap(),
            DiskStateEntry {
                hash: kept,
                size: 12,
                modified_nanos: 0,
            },
        );
        let mut tx = Transaction::new();
        DiskStates::new(datastore.as_ref()).put(&mut tx, &mut state).unwrap();
        datastore.commit(tx).unwrap();

        let preview = collect_garbage(datastore.as_ref(), &store, true).unwrap();
        assert_eq!(preview.containers_deleted, 1);
        assert!(store.have_file(&dropped).unwrap());

        let stats = collect_garbage(datastore.as_ref(), &store, false).unwrap();
        assert_eq!(stats.containers_deleted, 1);
        assert!(store.have_file(&kept).unwrap());
        assert!(!store.have_file(&dropped).unwrap());

        // Second run is a no-op
        let again = collect_garbage(datastore.as_ref(), &store, false).unwrap();
        assert_eq!(again, GcStats::default());
    }
}
