//! Loadouts: the desired state of a game installation.
//!
//! A [`Loadout`] is an arena of collections, groups, items and files linked
//! by typed ids. Groups carry sort rules and a dense conflict priority
//! (`1..=N`); later groups win path conflicts when the loadout is flattened.

use crate::datastore::{Datastore, DatastoreExt, Transaction};
use crate::error::{Error, Result};
use crate::game::GamePath;
use crate::hash::ContentHash;
use crate::sort::SortRule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Datastore key prefix of persisted loadouts.
pub const LOADOUT_PREFIX: &str = "loadout/";

const GAME_FILES_COLLECTION: &str = "Game Files";
const OVERRIDES_COLLECTION: &str = "Overrides";
const MODS_COLLECTION: &str = "Mods";

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(CollectionId, "c");
arena_id!(GroupId, "g");
arena_id!(ItemId, "i");
arena_id!(FileId, "f");

/// Dense 1-based position of a group in conflict resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictPriority(pub u32);

impl fmt::Display for ConflictPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Files of the unmodified game.
    GameFiles,
    /// A mod added by the user.
    Mod,
    /// Changes ingested from disk.
    Overrides,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::GameFiles => "game_files",
            GroupKind::Mod => "mod",
            GroupKind::Overrides => "overrides",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub read_only: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub collection: CollectionId,
    pub name: String,
    pub enabled: bool,
    pub rules: Vec<SortRule<GroupId>>,
    pub priority: ConflictPriority,
    pub kind: GroupKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub group: GroupId,
    pub name: String,
    pub enabled: bool,
}

/// A file the loadout wants at `target`.
///
/// `deleted` marks a tombstone: the path must be absent even if an earlier
/// group provides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadoutFile {
    pub item: ItemId,
    pub target: GamePath,
    pub hash: ContentHash,
    pub size: u64,
    #[serde(default)]
    pub deleted: bool,
}

/// Something that can be enabled or disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Collection(CollectionId),
    Group(GroupId),
    Item(ItemId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Before,
    After,
}

/// Change recorded in the overrides group for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideChange {
    /// The path holds this content.
    Content { hash: ContentHash, size: u64 },
    /// The path must not exist.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loadout {
    pub id: String,
    pub name: String,
    pub installation: String,
    pub revision: u64,
    collections: BTreeMap<CollectionId, Collection>,
    groups: BTreeMap<GroupId, Group>,
    items: BTreeMap<ItemId, Item>,
    files: BTreeMap<FileId, LoadoutFile>,
    next_id: u64,
}

impl Loadout {
    /// Empty loadout with a fresh random id.
    pub fn new(name: impl Into<String>, installation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.into(),
            installation: installation.into(),
            revision: 0,
            collections: BTreeMap::new(),
            groups: BTreeMap::new(),
            items: BTreeMap::new(),
            files: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn collections(&self) -> &BTreeMap<CollectionId, Collection> {
        &self.collections
    }

    pub fn groups(&self) -> &BTreeMap<GroupId, Group> {
        &self.groups
    }

    pub fn items(&self) -> &BTreeMap<ItemId, Item> {
        &self.items
    }

    pub fn files(&self) -> &BTreeMap<FileId, LoadoutFile> {
        &self.files
    }

    pub fn collection(&self, id: CollectionId) -> Result<&Collection> {
        self.collections
            .get(&id)
            .ok_or_else(|| Error::unknown_item("collection", id))
    }

    pub fn group(&self, id: GroupId) -> Result<&Group> {
        self.groups
            .get(&id)
            .ok_or_else(|| Error::unknown_item("group", id))
    }

    pub fn item(&self, id: ItemId) -> Result<&Item> {
        self.items
            .get(&id)
            .ok_or_else(|| Error::unknown_item("item", id))
    }

    /// Group whose name matches, lowest priority first.
    pub fn find_group(&self, name: &str) -> Option<GroupId> {
        self.groups_by_priority()
            .into_iter()
            .find(|(_, group)| group.name == name)
            .map(|(id, _)| id)
    }

    /// Groups in ascending priority order.
    pub fn groups_by_priority(&self) -> Vec<(GroupId, &Group)> {
        let mut groups: Vec<(GroupId, &Group)> =
            self.groups.iter().map(|(id, group)| (*id, group)).collect();
        groups.sort_by_key(|(id, group)| (group.priority, *id));
        groups
    }

    pub fn items_of(&self, group: GroupId) -> impl Iterator<Item = (ItemId, &Item)> {
        self.items
            .iter()
            .filter(move |(_, item)| item.group == group)
            .map(|(id, item)| (*id, item))
    }

    pub fn files_of(&self, item: ItemId) -> impl Iterator<Item = (FileId, &LoadoutFile)> {
        self.files
            .iter()
            .filter(move |(_, file)| file.item == item)
            .map(|(id, file)| (*id, file))
    }

    /// True if the group and its collection are enabled.
    pub fn is_group_active(&self, id: GroupId) -> bool {
        self.groups.get(&id).is_some_and(|group| {
            group.enabled
                && self
                    .collections
                    .get(&group.collection)
                    .is_some_and(|c| c.enabled)
        })
    }

    /// True if the item and every ancestor are enabled.
    pub fn is_item_active(&self, id: ItemId) -> bool {
        self.items
            .get(&id)
            .is_some_and(|item| item.enabled && self.is_group_active(item.group))
    }

    pub fn add_collection(&mut self, name: impl Into<String>, read_only: bool) -> CollectionId {
        let id = CollectionId(self.allocate());
        self.collections.insert(
            id,
            Collection {
                name: name.into(),
                read_only,
                enabled: true,
            },
        );
        id
    }

    /// Append a group at the end of the priority order.
    pub fn add_group(
        &mut self,
        collection: CollectionId,
        name: impl Into<String>,
        kind: GroupKind,
    ) -> Result<GroupId> {
        self.ensure_collection_editable(collection)?;
        Ok(self.insert_group(collection, name.into(), kind, Vec::new()))
    }

    fn insert_group(
        &mut self,
        collection: CollectionId,
        name: String,
        kind: GroupKind,
        rules: Vec<SortRule<GroupId>>,
    ) -> GroupId {
        let id = GroupId(self.allocate());
        let priority = ConflictPriority(self.groups.len() as u32 + 1);
        self.groups.insert(
            id,
            Group {
                collection,
                name,
                enabled: true,
                rules,
                priority,
                kind,
            },
        );
        id
    }

    pub fn add_item(&mut self, group: GroupId, name: impl Into<String>) -> Result<ItemId> {
        self.ensure_group_editable(group)?;
        Ok(self.insert_item(group, name.into()))
    }

    fn insert_item(&mut self, group: GroupId, name: String) -> ItemId {
        let id = ItemId(self.allocate());
        self.items.insert(
            id,
            Item {
                group,
                name,
                enabled: true,
            },
        );
        id
    }

    pub fn add_file(
        &mut self,
        item: ItemId,
        target: GamePath,
        hash: ContentHash,
        size: u64,
    ) -> Result<FileId> {
        let group = self.item(item)?.group;
        self.ensure_group_editable(group)?;
        Ok(self.insert_file(item, target, hash, size, false))
    }

    fn insert_file(
        &mut self,
        item: ItemId,
        target: GamePath,
        hash: ContentHash,
        size: u64,
        deleted: bool,
    ) -> FileId {
        let id = FileId(self.allocate());
        self.files.insert(
            id,
            LoadoutFile {
                item,
                target,
                hash,
                size,
                deleted,
            },
        );
        id
    }

    pub fn add_rule(&mut self, group: GroupId, rule: SortRule<GroupId>) -> Result<()> {
        self.ensure_group_editable(group)?;
        if let SortRule::Before(other) | SortRule::After(other) = &rule {
            self.group(*other)?;
        }
        if let Some(g) = self.groups.get_mut(&group) {
            g.rules.push(rule);
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, node: Node, enabled: bool) -> Result<()> {
        match node {
            Node::Collection(id) => {
                let collection = self
                    .collections
                    .get_mut(&id)
                    .ok_or_else(|| Error::unknown_item("collection", id))?;
                collection.enabled = enabled;
            }
            Node::Group(id) => {
                self.ensure_group_editable(id)?;
                if let Some(group) = self.groups.get_mut(&id) {
                    group.enabled = enabled;
                }
            }
            Node::Item(id) => {
                let group = self.item(id)?.group;
                self.ensure_group_editable(group)?;
                if let Some(item) = self.items.get_mut(&id) {
                    item.enabled = enabled;
                }
            }
        }
        Ok(())
    }

    /// Delete groups with their items and files, then compact priorities.
    ///
    /// Rules of other groups that point at a deleted group are dropped.
    pub fn remove_groups(&mut self, ids: &[GroupId]) -> Result<()> {
        for id in ids {
            self.ensure_group_editable(*id)?;
        }
        let doomed: HashSet<GroupId> = ids.iter().copied().collect();

        self.groups.retain(|id, _| !doomed.contains(id));
        self.items.retain(|_, item| !doomed.contains(&item.group));
        let items = &self.items;
        self.files.retain(|_, file| items.contains_key(&file.item));
        for group in self.groups.values_mut() {
            group.rules.retain(|rule| match rule {
                SortRule::Before(other) | SortRule::After(other) => !doomed.contains(other),
                SortRule::First | SortRule::Last => true,
            });
        }

        let order: Vec<GroupId> = self.groups_by_priority().into_iter().map(|(id, _)| id).collect();
        self.renumber(&order);
        Ok(())
    }

    /// Move a group directly before or after `anchor` and renumber.
    pub fn move_group(&mut self, id: GroupId, anchor: GroupId, placement: Placement) -> Result<()> {
        self.ensure_group_editable(id)?;
        self.group(anchor)?;
        if id == anchor {
            return Ok(());
        }

        let mut order: Vec<GroupId> = self
            .groups_by_priority()
            .into_iter()
            .map(|(g, _)| g)
            .filter(|g| *g != id)
            .collect();
        let position = order
            .iter()
            .position(|g| *g == anchor)
            .ok_or_else(|| Error::unknown_item("group", anchor))?;
        let insert_at = match placement {
            Placement::Before => position,
            Placement::After => position + 1,
        };
        order.insert(insert_at, id);
        self.renumber(&order);
        Ok(())
    }

    fn renumber(&mut self, order: &[GroupId]) {
        for (index, id) in order.iter().enumerate() {
            if let Some(group) = self.groups.get_mut(id) {
                group.priority = ConflictPriority(index as u32 + 1);
            }
        }
    }

    /// The game files group, created on first use.
    ///
    /// It lives in a read-only collection and sorts `First`.
    pub fn game_files_group(&mut self) -> GroupId {
        if let Some(id) = self.group_of_kind(GroupKind::GameFiles) {
            return id;
        }
        let collection = self.add_collection(GAME_FILES_COLLECTION, true);
        let group = self.insert_group(
            collection,
            GAME_FILES_COLLECTION.to_string(),
            GroupKind::GameFiles,
            vec![SortRule::First],
        );
        self.insert_item(group, "Base game".to_string());
        group
    }

    /// The overrides group, created on first use.
    ///
    /// It lives in its own editable collection and sorts `Last`.
    pub fn overrides_group(&mut self) -> GroupId {
        if let Some(id) = self.group_of_kind(GroupKind::Overrides) {
            return id;
        }
        let collection = self.add_collection(OVERRIDES_COLLECTION, false);
        let group = self.insert_group(
            collection,
            OVERRIDES_COLLECTION.to_string(),
            GroupKind::Overrides,
            vec![SortRule::Last],
        );
        self.insert_item(group, "Ingested changes".to_string());
        group
    }

    /// The editable collection that imported mods go into.
    pub fn mods_collection(&mut self) -> CollectionId {
        let existing = self
            .collections
            .iter()
            .find(|(_, c)| c.name == MODS_COLLECTION && !c.read_only)
            .map(|(id, _)| *id);
        match existing {
            Some(id) => id,
            None => self.add_collection(MODS_COLLECTION, false),
        }
    }

    fn group_of_kind(&self, kind: GroupKind) -> Option<GroupId> {
        self.groups
            .iter()
            .find(|(_, group)| group.kind == kind)
            .map(|(id, _)| *id)
    }

    fn first_item_of(&mut self, group: GroupId, name: &str) -> ItemId {
        let existing = self.items_of(group).next().map(|(id, _)| id);
        match existing {
            Some(id) => id,
            None => self.insert_item(group, name.to_string()),
        }
    }

    /// Add a file to the game files group, bypassing the read-only check.
    pub(crate) fn add_game_file(&mut self, target: GamePath, hash: ContentHash, size: u64) -> FileId {
        let group = self.game_files_group();
        let item = self.first_item_of(group, "Base game");
        self.insert_file(item, target, hash, size, false)
    }

    /// Record a change in the overrides group, replacing an earlier one.
    pub fn set_override(&mut self, target: GamePath, change: OverrideChange) -> FileId {
        let group = self.overrides_group();
        let item = self.first_item_of(group, "Ingested changes");
        let overrides: HashSet<ItemId> = self.items_of(group).map(|(id, _)| id).collect();
        self.files
            .retain(|_, file| !(overrides.contains(&file.item) && file.target == target));

        match change {
            OverrideChange::Content { hash, size } => self.insert_file(item, target, hash, size, false),
            OverrideChange::Removed => {
                let hash = ContentHash::hash_bytes(&[]);
                self.insert_file(item, target, hash, 0, true)
            }
        }
    }

    /// Every content hash referenced by a non-tombstone file, enabled or not.
    pub fn all_hashes(&self) -> HashSet<ContentHash> {
        self.files
            .values()
            .filter(|file| !file.deleted)
            .map(|file| file.hash)
            .collect()
    }

    fn ensure_collection_editable(&self, id: CollectionId) -> Result<()> {
        let collection = self.collection(id)?;
        if collection.read_only {
            return Err(Error::read_only_collection(collection.name.clone()));
        }
        Ok(())
    }

    fn ensure_group_editable(&self, id: GroupId) -> Result<()> {
        let group = self.group(id)?;
        self.ensure_collection_editable(group.collection)
    }
}

/// Loadouts persisted in a [`Datastore`] under `loadout/{id}`.
pub struct Loadouts<'a> {
    datastore: &'a dyn Datastore,
}

impl<'a> Loadouts<'a> {
    pub fn new(datastore: &'a dyn Datastore) -> Self {
        Self { datastore }
    }

    fn key(id: &str) -> String {
        format!("{}{}", LOADOUT_PREFIX, id)
    }

    /// Create and persist an empty loadout.
    pub fn create(&self, name: &str, installation: &str) -> Result<Loadout> {
        let mut loadout = Loadout::new(name, installation);
        self.save(&mut loadout)?;
        Ok(loadout)
    }

    pub fn get(&self, id: &str) -> Result<Option<Loadout>> {
        self.datastore.get_json(&Self::key(id))
    }

    /// Look a loadout up by id, then by unique name.
    pub fn find(&self, id_or_name: &str) -> Result<Loadout> {
        if let Some(loadout) = self.get(id_or_name)? {
            return Ok(loadout);
        }
        let mut matches: Vec<Loadout> = self
            .list()?
            .into_iter()
            .filter(|l| l.name == id_or_name)
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::unknown_item("loadout", id_or_name)),
            _ => Err(Error::unknown_item("loadout (ambiguous name)", id_or_name)),
        }
    }

    pub fn list(&self) -> Result<Vec<Loadout>> {
        Ok(self
            .datastore
            .scan_json::<Loadout>(LOADOUT_PREFIX)?
            .into_iter()
            .map(|(_, loadout)| loadout)
            .collect())
    }

    /// Stage `loadout` in `tx`, bumping its revision.
    pub fn put(&self, tx: &mut Transaction, loadout: &mut Loadout) -> Result<()> {
        loadout.revision += 1;
        tx.assert_json(Self::key(&loadout.id), loadout)
    }

    /// Persist `loadout` in its own transaction.
    pub fn save(&self, loadout: &mut Loadout) -> Result<()> {
        let mut tx = Transaction::new();
        self.put(&mut tx, loadout)?;
        self.datastore.commit(tx)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        if self.get(id)?.is_none() {
            return Err(Error::unknown_item("loadout", id));
        }
        let mut tx = Transaction::new();
        tx.retract(Self::key(id));
        self.datastore.commit(tx)?;
        Ok(())
    }
}
