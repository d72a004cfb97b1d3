//! Three-way comparison of disk, last snapshot and loadout.
//!
//! Every path in the union of the three sources gets a [`Signature`]
//! describing which sources have it, which of them agree, and whether the
//! content is archived. The signature alone decides the path's
//! [`Classification`]; plans are the classified paths turned into ordered
//! [`Action`]s.
//!
//! ```text
//! disk prev loadout                       apply            ingest
//! ---- ---- -------                       -----            ------
//!  -    -     -                           no-op            no-op
//!  -    -     L                           deploy           -
//!  -    P     -                           no-op            no-op
//!  -    P     L                           external change  ingest removed
//!  D    -     -                           external change  ingest new
//!  D    -     L   D == L                  adopt            -
//!  D    -     L   D != L                  external change  ingest changed
//!  D    P     -   D == P                  remove           -
//!  D    P     -   D != P                  external change  ingest changed
//!  D    P     L   D == P == L             no-op            no-op
//!  D    P     L   D == P != L             deploy           -
//!  D    P     L   D != P, D == L          adopt            -
//!  D    P     L   D != P, D != L          external change  ingest changed
//! ```
//!
//! Ignored paths are classified [`Classification::Ignored`] no matter what
//! the loadout says.

use crate::disk_state::{DiskState, DiskStateEntry};
use crate::error::{Error, Result};
use crate::flatten::{FlattenedFile, FlattenedLoadout};
use crate::game::{GameInstallation, GamePath};
use crate::hash::ContentHash;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Which plan a classification is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Apply,
    Ingest,
}

/// Presence and equality facts of one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Signature {
    pub disk: bool,
    pub prev: bool,
    pub loadout: bool,
    pub disk_eq_prev: bool,
    pub prev_eq_loadout: bool,
    pub disk_eq_loadout: bool,
    pub disk_archived: bool,
    pub loadout_archived: bool,
    pub ignored: bool,
}

impl Signature {
    pub fn new(
        disk: Option<&ContentHash>,
        prev: Option<&ContentHash>,
        loadout: Option<&ContentHash>,
        archived: &HashSet<ContentHash>,
        ignored: bool,
    ) -> Self {
        let eq = |a: Option<&ContentHash>, b: Option<&ContentHash>| matches!((a, b), (Some(a), Some(b)) if a == b);
        Self {
            disk: disk.is_some(),
            prev: prev.is_some(),
            loadout: loadout.is_some(),
            disk_eq_prev: eq(disk, prev),
            prev_eq_loadout: eq(prev, loadout),
            disk_eq_loadout: eq(disk, loadout),
            disk_archived: disk.is_some_and(|h| archived.contains(h)),
            loadout_archived: loadout.is_some_and(|h| archived.contains(h)),
            ignored,
        }
    }

    pub fn classify(&self, mode: PlanMode) -> Classification {
        use Classification::*;

        if self.ignored {
            return Ignored;
        }
        let external = |ingest: Classification| match mode {
            PlanMode::Apply => ExternalChange,
            PlanMode::Ingest => ingest,
        };

        match (self.disk, self.prev, self.loadout) {
            (false, false, false) => NoOp,
            (false, false, true) => Deploy,
            (false, true, false) => NoOp,
            (false, true, true) => external(IngestRemoved),
            (true, false, false) => external(IngestNew),
            (true, false, true) if self.disk_eq_loadout => Adopt,
            (true, false, true) => external(IngestChanged),
            (true, true, false) if self.disk_eq_prev => Remove,
            (true, true, false) => external(IngestChanged),
            (true, true, true) if self.disk_eq_prev && self.prev_eq_loadout => NoOp,
            (true, true, true) if self.disk_eq_prev => Deploy,
            (true, true, true) if self.disk_eq_loadout => Adopt,
            (true, true, true) => external(IngestChanged),
        }
    }
}

/// Outcome for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    NoOp,
    /// Write the loadout's content.
    Deploy,
    /// Delete the disk content the loadout no longer wants.
    Remove,
    /// Disk changed behind our back; apply must not proceed.
    ExternalChange,
    IngestNew,
    IngestRemoved,
    IngestChanged,
    Ignored,
    /// Disk already holds what the loadout wants.
    Adopt,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::NoOp => "no-op",
            Classification::Deploy => "deploy",
            Classification::Remove => "remove",
            Classification::ExternalChange => "external-change",
            Classification::IngestNew => "ingest-new",
            Classification::IngestRemoved => "ingest-removed",
            Classification::IngestChanged => "ingest-changed",
            Classification::Ignored => "ignored",
            Classification::Adopt => "adopt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncNode {
    pub disk: Option<DiskStateEntry>,
    pub prev: Option<DiskStateEntry>,
    pub loadout: Option<FlattenedFile>,
    pub signature: Signature,
    pub classification: Classification,
}

/// Classified union of disk, previous snapshot and loadout paths.
#[derive(Debug, Clone, Default)]
pub struct SyncTree {
    nodes: BTreeMap<GamePath, SyncNode>,
}

impl SyncTree {
    /// Classify every path; `prev` is `None` before the first snapshot.
    pub fn build(
        installation: &GameInstallation,
        disk: &DiskState,
        prev: Option<&DiskState>,
        loadout: &FlattenedLoadout,
        archived: &HashSet<ContentHash>,
        mode: PlanMode,
    ) -> Self {
        let mut paths: BTreeSet<&GamePath> = disk.entries.keys().collect();
        if let Some(prev) = prev {
            paths.extend(prev.entries.keys());
        }
        paths.extend(loadout.files().keys());

        let nodes = paths
            .into_iter()
            .map(|path| {
                let disk_entry = disk.entries.get(path).copied();
                let prev_entry = prev.and_then(|p| p.entries.get(path)).copied();
                let loadout_entry = loadout.get(path).cloned();
                let signature = Signature::new(
                    disk_entry.as_ref().map(|e| &e.hash),
                    prev_entry.as_ref().map(|e| &e.hash),
                    loadout_entry.as_ref().map(|f| &f.hash),
                    archived,
                    installation.is_ignored(path),
                );
                let node = SyncNode {
                    disk: disk_entry,
                    prev: prev_entry,
                    loadout: loadout_entry,
                    classification: signature.classify(mode),
                    signature,
                };
                (path.clone(), node)
            })
            .collect();
        Self { nodes }
    }

    pub fn nodes(&self) -> &BTreeMap<GamePath, SyncNode> {
        &self.nodes
    }

    pub fn get(&self, path: &GamePath) -> Option<&SyncNode> {
        self.nodes.get(path)
    }

    /// Number of paths per classification.
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        let mut summary = BTreeMap::new();
        for node in self.nodes.values() {
            *summary.entry(node.classification.as_str()).or_default() += 1;
        }
        summary
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Store the disk content at `path`.
    BackupFile {
        path: GamePath,
        hash: ContentHash,
        size: u64,
    },
    DeleteFile {
        path: GamePath,
        hash: ContentHash,
        size: u64,
    },
    ExtractFile {
        path: GamePath,
        hash: ContentHash,
        size: u64,
    },
    CreateInLoadout {
        path: GamePath,
        hash: ContentHash,
        size: u64,
    },
    RemoveFromLoadout { path: GamePath },
}

impl Action {
    pub fn path(&self) -> &GamePath {
        match self {
            Action::BackupFile { path, .. }
            | Action::DeleteFile { path, .. }
            | Action::ExtractFile { path, .. }
            | Action::CreateInLoadout { path, .. }
            | Action::RemoveFromLoadout { path } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::BackupFile { .. } => "backup",
            Action::DeleteFile { .. } => "delete",
            Action::ExtractFile { .. } => "extract",
            Action::CreateInLoadout { .. } => "create-in-loadout",
            Action::RemoveFromLoadout { .. } => "remove-from-loadout",
        }
    }
}

/// Steps that bring disk in line with the loadout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    pub installation: String,
    /// Backups, then deletes, then extractions, each by path.
    pub actions: Vec<Action>,
    /// Paths changed on disk since the last snapshot.
    pub conflicts: Vec<GamePath>,
    /// Paths already matching the loadout without a snapshot.
    pub adopted: Vec<GamePath>,
    /// Disk content after the plan ran (modification times unset).
    pub expected: BTreeMap<GamePath, DiskStateEntry>,
}

impl ApplyPlan {
    /// Turn an apply-mode tree into a plan.
    ///
    /// Fails with [`Error::MissingContent`] if the loadout wants content
    /// that is neither archived nor already on disk.
    pub fn from_tree(installation: &str, tree: &SyncTree) -> Result<Self> {
        let mut backups = Vec::new();
        let mut deletes = Vec::new();
        let mut extracts = Vec::new();
        let mut plan = ApplyPlan {
            installation: installation.to_string(),
            ..ApplyPlan::default()
        };

        for (path, node) in tree.nodes() {
            if node.classification == Classification::Ignored {
                continue;
            }
            if let Some(file) = &node.loadout {
                plan.expected.insert(
                    path.clone(),
                    DiskStateEntry {
                        hash: file.hash,
                        size: file.size,
                        modified_nanos: 0,
                    },
                );
            }

            match node.classification {
                Classification::Deploy => {
                    let Some(file) = &node.loadout else { continue };
                    if !node.signature.loadout_archived {
                        return Err(Error::missing_content(file.hash.to_hex()));
                    }
                    if let Some(disk) = &node.disk
                        && !node.signature.disk_archived
                    {
                        backups.push(Action::BackupFile {
                            path: path.clone(),
                            hash: disk.hash,
                            size: disk.size,
                        });
                    }
                    extracts.push(Action::ExtractFile {
                        path: path.clone(),
                        hash: file.hash,
                        size: file.size,
                    });
                }
                Classification::Remove => {
                    let Some(disk) = &node.disk else { continue };
                    if !node.signature.disk_archived {
                        backups.push(Action::BackupFile {
                            path: path.clone(),
                            hash: disk.hash,
                            size: disk.size,
                        });
                    }
                    deletes.push(Action::DeleteFile {
                        path: path.clone(),
                        hash: disk.hash,
                        size: disk.size,
                    });
                }
                Classification::Adopt => plan.adopted.push(path.clone()),
                Classification::ExternalChange
                | Classification::IngestNew
                | Classification::IngestRemoved
                | Classification::IngestChanged => plan.conflicts.push(path.clone()),
                Classification::NoOp | Classification::Ignored => {}
            }
        }

        plan.actions = backups.into_iter().chain(deletes).chain(extracts).collect();
        Ok(plan)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// True if executing the plan would not touch the disk.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, name: &str) -> usize {
        self.actions.iter().filter(|a| a.name() == name).count()
    }
}

/// Steps that record disk changes in the loadout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestPlan {
    pub installation: String,
    /// Backups, then loadout changes by path.
    pub actions: Vec<Action>,
    /// The scanned disk, minus ignored paths; becomes the new snapshot.
    pub expected: BTreeMap<GamePath, DiskStateEntry>,
}

impl IngestPlan {
    /// Turn an ingest-mode tree into a plan.
    pub fn from_tree(installation: &str, tree: &SyncTree) -> Self {
        let mut backups = Vec::new();
        let mut changes = Vec::new();
        let mut expected = BTreeMap::new();

        for (path, node) in tree.nodes() {
            if node.classification == Classification::Ignored {
                continue;
            }
            if let Some(disk) = node.disk {
                expected.insert(path.clone(), disk);
            }
            match (node.classification, &node.disk) {
                (Classification::IngestNew | Classification::IngestChanged, Some(disk)) => {
                    if !node.signature.disk_archived {
                        backups.push(Action::BackupFile {
                            path: path.clone(),
                            hash: disk.hash,
                            size: disk.size,
                        });
                    }
                    changes.push(Action::CreateInLoadout {
                        path: path.clone(),
                        hash: disk.hash,
                        size: disk.size,
                    });
                }
                (Classification::IngestRemoved, _) => {
                    changes.push(Action::RemoveFromLoadout { path: path.clone() });
                }
                _ => {}
            }
        }

        Self {
            installation: installation.to_string(),
            actions: backups.into_iter().chain(changes).collect(),
            expected,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, name: &str) -> usize {
        self.actions.iter().filter(|a| a.name() == name).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::flatten_for;
    use crate::game::LocationId;
    use crate::loadout::{GroupKind, Loadout};

    fn h(s: &str) -> ContentHash {
        ContentHash::hash_bytes(s.as_bytes())
    }

    fn path(s: &str) -> GamePath {
        GamePath::parse(s).unwrap()
    }

    fn installation(patterns: &[&str]) -> GameInstallation {
        let mut locations = BTreeMap::new();
        locations.insert(LocationId::new("game").unwrap(), "/g".into());
        locations.insert(LocationId::new("saves").unwrap(), "/s".into());
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        GameInstallation::new("test", locations, &patterns).unwrap()
    }

    /// `data` sits inside `game`, so `game/Data/x` and `data/x` are one file.
    fn nested_installation() -> GameInstallation {
        let mut locations = BTreeMap::new();
        locations.insert(LocationId::new("game").unwrap(), "/g".into());
        locations.insert(LocationId::new("data").unwrap(), "/g/Data".into());
        locations.insert(LocationId::new("saves").unwrap(), "/s".into());
        GameInstallation::new("test", locations, &[]).unwrap()
    }

    fn disk(files: &[(&str, &str)]) -> DiskState {
        let mut state = DiskState::new("test");
        for (p, c) in files {
            state.entries.insert(
                path(p),
                DiskStateEntry {
                    hash: h(c),
                    size: c.len() as u64,
                    modified_nanos: 1,
                },
            );
        }
        state
    }

    fn flat(files: &[(&str, &str)]) -> FlattenedLoadout {
        let mut loadout = Loadout::new("l", "test");
        let mods = loadout.mods_collection();
        let group = loadout.add_group(mods, "m", GroupKind::Mod).unwrap();
        let item = loadout.add_item(group, "m").unwrap();
        for (p, c) in files {
            loadout.add_file(item, path(p), h(c), c.len() as u64).unwrap();
        }
        crate::flatten::flatten(&loadout).unwrap()
    }

    fn all_archived(contents: &[&str]) -> HashSet<ContentHash> {
        contents.iter().map(|c| h(c)).collect()
    }

    fn sig(d: Option<&str>, p: Option<&str>, l: Option<&str>) -> Signature {
        let (d, p, l) = (d.map(h), p.map(h), l.map(h));
        Signature::new(d.as_ref(), p.as_ref(), l.as_ref(), &HashSet::new(), false)
    }

    #[test]
    fn test_classification_table() {
        use Classification::*;
        let cases = [
            (None, None, Some("l"), Deploy, Deploy),
            (None, Some("p"), None, NoOp, NoOp),
            (None, Some("p"), Some("p"), ExternalChange, IngestRemoved),
            (Some("d"), None, None, ExternalChange, IngestNew),
            (Some("x"), None, Some("x"), Adopt, Adopt),
            (Some("d"), None, Some("l"), ExternalChange, IngestChanged),
            (Some("x"), Some("x"), None, Remove, Remove),
            (Some("d"), Some("p"), None, ExternalChange, IngestChanged),
            (Some("x"), Some("x"), Some("x"), NoOp, NoOp),
            (Some("x"), Some("x"), Some("l"), Deploy, Deploy),
            (Some("d"), Some("p"), Some("d"), Adopt, Adopt),
            (Some("d"), Some("p"), Some("p"), ExternalChange, IngestChanged),
            (Some("d"), Some("p"), Some("l"), ExternalChange, IngestChanged),
        ];
        for (d, p, l, apply, ingest) in cases {
            let s = sig(d, p, l);
            assert_eq!(s.classify(PlanMode::Apply), apply, "{d:?} {p:?} {l:?}");
            assert_eq!(s.classify(PlanMode::Ingest), ingest, "{d:?} {p:?} {l:?}");
        }
    }

    #[test]
    fn test_ignore_wins_over_loadout() {
        let inst = installation(&["saves/"]);
        let tree = SyncTree::build(
            &inst,
            &disk(&[("saves/slot1", "mine")]),
            None,
            &flat(&[("saves/slot1", "theirs")]),
            &all_archived(&["theirs"]),
            PlanMode::Apply,
        );
        assert_eq!(tree.get(&path("saves/slot1")).unwrap().classification, Classification::Ignored);

        let plan = ApplyPlan::from_tree("test", &tree).unwrap();
        assert!(plan.is_empty());
        assert!(!plan.has_conflicts());
        assert!(plan.expected.is_empty());
    }

    #[test]
    fn test_apply_plan_order() {
        let inst = installation(&[]);
        let prev = disk(&[("game/old", "old"), ("game/keep", "keep"), ("game/swap", "v1")]);
        let now = prev.clone();
        let loadout = flat(&[("game/keep", "keep"), ("game/swap", "v2"), ("game/new", "new")]);
        let archived = all_archived(&["keep", "v2", "new"]);

        let tree = SyncTree::build(&inst, &now, Some(&prev), &loadout, &archived, PlanMode::Apply);
        let plan = ApplyPlan::from_tree("test", &tree).unwrap();

        let steps: Vec<(&str, String)> = plan
            .actions
            .iter()
            .map(|a| (a.name(), a.path().to_string()))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("backup", "game/old".to_string()),
                ("backup", "game/swap".to_string()),
                ("delete", "game/old".to_string()),
                ("extract", "game/new".to_string()),
                ("extract", "game/swap".to_string()),
            ]
        );
        assert_eq!(plan.expected.len(), 3);
        assert!(plan.expected.contains_key(&path("game/new")));
        assert!(!plan.expected.contains_key(&path("game/old")));
    }

    #[test]
    fn test_apply_detects_conflict() {
        let inst = installation(&[]);
        let prev = disk(&[("game/ini", "v1")]);
        let now = disk(&[("game/ini", "edited")]);
        let loadout = flat(&[("game/ini", "v1"), ("game/new", "new")]);

        let tree = SyncTree::build(&inst, &now, Some(&prev), &loadout, &all_archived(&["v1", "new"]), PlanMode::Apply);
        let plan = ApplyPlan::from_tree("test", &tree).unwrap();
        assert_eq!(plan.conflicts, vec![path("game/ini")]);
    }

    #[test]
    fn test_missing_content_fails_plan() {
        let inst = installation(&[]);
        let tree = SyncTree::build(
            &inst,
            &DiskState::new("test"),
            None,
            &flat(&[("game/a", "never stored")]),
            &HashSet::new(),
            PlanMode::Apply,
        );
        let err = ApplyPlan::from_tree("test", &tree).unwrap_err();
        assert!(err.is_missing_content());
    }

    #[test]
    fn test_ingest_plan() {
        let inst = installation(&[]);
        let prev = disk(&[("game/gone", "g"), ("game/edit", "v1"), ("game/same", "s")]);
        let now = disk(&[("game/edit", "v2"), ("game/same", "s"), ("game/fresh", "f")]);
        let loadout = flat(&[("game/gone", "g"), ("game/edit", "v1"), ("game/same", "s")]);
        let archived = all_archived(&["g", "v1", "s", "f"]);

        let tree = SyncTree::build(&inst, &now, Some(&prev), &loadout, &archived, PlanMode::Ingest);
        let plan = IngestPlan::from_tree("test", &tree);

        let steps: Vec<(&str, String)> = plan
            .actions
            .iter()
            .map(|a| (a.name(), a.path().to_string()))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("backup", "game/edit".to_string()),
                ("create-in-loadout", "game/edit".to_string()),
                ("create-in-loadout", "game/fresh".to_string()),
                ("remove-from-loadout", "game/gone".to_string()),
            ]
        );
        assert_eq!(plan.expected, now.entries);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Every combination classifies, and apply never both deploys and conflicts
        #[test]
        fn prop_classification_total(
            d in prop::option::of(0u8..3),
            p in prop::option::of(0u8..3),
            l in prop::option::of(0u8..3),
            archived in prop::collection::hash_set(0u8..3, 0..3),
            ignored in any::<bool>(),
        ) {
            let hash = |n: u8| ContentHash::hash_bytes(&[n]);
            let archived: HashSet<ContentHash> = archived.into_iter().map(hash).collect();
            let (d, p, l) = (d.map(hash), p.map(hash), l.map(hash));
            let s = Signature::new(d.as_ref(), p.as_ref(), l.as_ref(), &archived, ignored);

            let apply = s.classify(PlanMode::Apply);
            let ingest = s.classify(PlanMode::Ingest);
            prop_assert!(!matches!(
                apply,
                Classification::IngestNew | Classification::IngestRemoved | Classification::IngestChanged
            ));
            prop_assert_ne!(ingest, Classification::ExternalChange);
            // Modes only disagree on external changes
            if apply != Classification::ExternalChange {
                prop_assert_eq!(apply, ingest);
            }
            if ignored {
                prop_assert_eq!(apply, Classification::Ignored);
            }
        }

        /// Executing an apply plan and recomputing yields an empty plan
        #[test]
        fn prop_apply_idempotent(
            disk_files in prop::collection::btree_map(0u8..6, 0u8..3, 0..6),
            loadout_files in prop::collection::btree_map(0u8..6, 0u8..3, 0..6),
        ) {
            let inst = installation(&[]);
            let to_disk = |files: &BTreeMap<u8, u8>| {
                let mut state = DiskState::new("test");
                for (p, c) in files {
                    state.entries.insert(
                        path(&format!("game/f{p}")),
                        DiskStateEntry { hash: ContentHash::hash_bytes(&[*c]), size: 1, modified_nanos: 0 },
                    );
                }
                state
            };
            let now = to_disk(&disk_files);
            let loadout_pairs: Vec<(String, String)> = loadout_files
                .iter()
                .map(|(p, c)| (format!("game/f{p}"), (*c as char).to_string()))
                .collect();
            let refs: Vec<(&str, &str)> = loadout_pairs.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
            let loadout = flat(&refs);
            let archived: HashSet<ContentHash> = loadout.files().values().map(|f| f.hash).collect();

            // First apply from the matching snapshot so nothing conflicts
            let tree = SyncTree::build(&inst, &now, Some(&now), &loadout, &archived, PlanMode::Apply);
            let plan = ApplyPlan::from_tree("test", &tree)?;
            prop_assert!(!plan.has_conflicts());

            let after = DiskState { installation: "test".into(), generation: 1, entries: plan.expected.clone() };
            let tree = SyncTree::build(&inst, &after, Some(&after), &loadout, &archived, PlanMode::Apply);
            let again = ApplyPlan::from_tree("test", &tree)?;
            prop_assert!(again.is_empty());
            prop_assert!(!again.has_conflicts());
        }

        /// Apply stays idempotent when locations nest and targets name either root
        #[test]
        fn prop_apply_idempotent_nested_locations(
            disk_files in prop::collection::btree_map((0u8..4, 0u8..4), 0u8..3, 0..8),
            loadout_files in prop::collection::btree_map((0u8..4, 0u8..4), 0u8..3, 0..8),
        ) {
            let inst = nested_installation();
            let spell = |(root, n): (u8, u8)| match root {
                0 => format!("game/f{n}"),
                1 => format!("game/Data/f{n}"),
                2 => format!("data/f{n}"),
                _ => format!("saves/f{n}"),
            };

            // Scans only ever report the deepest root
            let mut now = DiskState::new("test");
            for (key, c) in &disk_files {
                now.entries.insert(
                    inst.canonical(&path(&spell(*key))),
                    DiskStateEntry { hash: ContentHash::hash_bytes(&[*c]), size: 1, modified_nanos: 0 },
                );
            }
            let mut loadout = Loadout::new("l", "test");
            let mods = loadout.mods_collection();
            let group = loadout.add_group(mods, "m", GroupKind::Mod)?;
            let item = loadout.add_item(group, "m")?;
            for (key, c) in &loadout_files {
                loadout.add_file(item, path(&spell(*key)), ContentHash::hash_bytes(&[*c]), 1)?;
            }
            let flat = flatten_for(&loadout, &inst)?;
            let archived: HashSet<ContentHash> = flat.files().values().map(|f| f.hash).collect();

            let tree = SyncTree::build(&inst, &now, Some(&now), &flat, &archived, PlanMode::Apply);
            let plan = ApplyPlan::from_tree("test", &tree)?;
            prop_assert!(!plan.has_conflicts());

            // What a rescan reports once the plan ran
            let mut after = DiskState::new("test");
            for (p, entry) in &plan.expected {
                let scanned = inst.canonical(p);
                prop_assert_eq!(&scanned, p);
                after.entries.insert(scanned, *entry);
            }
            let tree = SyncTree::build(&inst, &after, Some(&after), &flat, &archived, PlanMode::Apply);
            let again = ApplyPlan::from_tree("test", &tree)?;
            prop_assert!(again.is_empty());
            prop_assert!(!again.has_conflicts());
        }
    }
}
