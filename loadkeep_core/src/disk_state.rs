//! Snapshots of what is on disk after each successful apply or ingest.

use crate::datastore::{Datastore, DatastoreExt, Transaction};
use crate::error::Result;
use crate::game::GamePath;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Datastore key prefix of disk state snapshots.
pub const DISK_STATE_PREFIX: &str = "disk_state/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStateEntry {
    pub hash: ContentHash,
    pub size: u64,
    pub modified_nanos: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskState {
    pub installation: String,
    /// 0 for the first recorded state; assigned by [`DiskStates::put`].
    pub generation: u64,
    pub entries: BTreeMap<GamePath, DiskStateEntry>,
}

impl DiskState {
    pub fn new(installation: impl Into<String>) -> Self {
        Self {
            installation: installation.into(),
            generation: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// Disk states persisted under `disk_state/{installation}/{generation:020}`.
pub struct DiskStates<'a> {
    datastore: &'a dyn Datastore,
}

impl<'a> DiskStates<'a> {
    pub fn new(datastore: &'a dyn Datastore) -> Self {
        Self { datastore }
    }

    fn prefix(installation: &str) -> String {
        format!("{}{}/", DISK_STATE_PREFIX, installation)
    }

    fn key(installation: &str, generation: u64) -> String {
        format!("{}{:020}", Self::prefix(installation), generation)
    }

    /// Most recent snapshot of an installation.
    pub fn latest(&self, installation: &str) -> Result<Option<DiskState>> {
        // Zero-padded generations sort numerically
        Ok(self
            .datastore
            .scan_json::<DiskState>(&Self::prefix(installation))?
            .pop()
            .map(|(_, state)| state))
    }

    pub fn at(&self, installation: &str, generation: u64) -> Result<Option<DiskState>> {
        self.datastore.get_json(&Self::key(installation, generation))
    }

    /// The state recorded when the bare game was first indexed.
    pub fn initial(&self, installation: &str) -> Result<Option<DiskState>> {
        self.at(installation, 0)
    }

    /// Every snapshot of an installation, oldest first.
    pub fn history(&self, installation: &str) -> Result<Vec<DiskState>> {
        Ok(self
            .datastore
            .scan_json::<DiskState>(&Self::prefix(installation))?
            .into_iter()
            .map(|(_, state)| state)
            .collect())
    }

    /// Stage `state` in `tx` as the next generation of its installation.
    pub fn put(&self, tx: &mut Transaction, state: &mut DiskState) -> Result<()> {
        state.generation = match self.latest(&state.installation)? {
            Some(latest) => latest.generation + 1,
            None => 0,
        };
        tx.assert_json(Self::key(&state.installation, state.generation), state)
    }

    /// Every hash recorded by any snapshot of any installation.
    pub fn all_hashes(&self) -> Result<HashSet<ContentHash>> {
        Ok(self
            .datastore
            .scan_json::<DiskState>(DISK_STATE_PREFIX)?
            .into_iter()
            .flat_map(|(_, state)| state.entries.into_values().map(|e| e.hash))
            .collect())
    }
}
