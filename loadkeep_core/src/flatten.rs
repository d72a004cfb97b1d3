//! Resolve a loadout into one file per game path.

use crate::error::Result;
use crate::game::{GameInstallation, GamePath};
use crate::hash::ContentHash;
use crate::loadout::{FileId, Group, GroupId, Loadout};
use crate::sort::sort_by_rules;
use std::collections::BTreeMap;

/// The file that won a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenedFile {
    pub file: FileId,
    pub group: GroupId,
    pub hash: ContentHash,
    pub size: u64,
}

/// Result of [`flatten`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenedLoadout {
    files: BTreeMap<GamePath, FlattenedFile>,
    claims: BTreeMap<GamePath, Vec<GroupId>>,
}

impl FlattenedLoadout {
    pub fn get(&self, path: &GamePath) -> Option<&FlattenedFile> {
        self.files.get(path)
    }

    pub fn files(&self) -> &BTreeMap<GamePath, FlattenedFile> {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths claimed by more than one enabled group, with the claimants in
    /// sort order (the last one won).
    pub fn conflicts(&self) -> BTreeMap<&GamePath, &[GroupId]> {
        self.claims
            .iter()
            .filter(|(_, groups)| groups.len() > 1)
            .map(|(path, groups)| (path, groups.as_slice()))
            .collect()
    }
}

/// Sort the loadout's groups and let the last claimant of each path win.
///
/// Disabled groups still take part in sorting so rules that mention them
/// stay satisfiable, but contribute no files. A winning tombstone removes
/// the path.
pub fn flatten(loadout: &Loadout) -> Result<FlattenedLoadout> {
    flatten_with(loadout, GamePath::clone)
}

/// [`flatten`] keyed by the paths a scan of `installation` reports.
///
/// Targets written through an outer location (`game/Data/a.esp`) and ones
/// written through a nested location (`data/a.esp`) claim the same path.
pub fn flatten_for(loadout: &Loadout, installation: &GameInstallation) -> Result<FlattenedLoadout> {
    flatten_with(loadout, |target| installation.canonical(target))
}

fn flatten_with(
    loadout: &Loadout,
    map_target: impl Fn(&GamePath) -> GamePath,
) -> Result<FlattenedLoadout> {
    let groups: Vec<(GroupId, &Group)> = loadout.groups().iter().map(|(id, g)| (*id, g)).collect();
    let sorted = sort_by_rules(
        groups,
        |(id, _)| *id,
        |(_, group)| group.rules.clone(),
        |(_, group)| group.priority,
    )?;

    let mut winners: BTreeMap<GamePath, (FlattenedFile, bool)> = BTreeMap::new();
    let mut claims: BTreeMap<GamePath, Vec<GroupId>> = BTreeMap::new();

    for (group_id, _) in sorted {
        if !loadout.is_group_active(group_id) {
            continue;
        }
        for (item_id, _) in loadout.items_of(group_id) {
            if !loadout.is_item_active(item_id) {
                continue;
            }
            for (file_id, file) in loadout.files_of(item_id) {
                let target = map_target(&file.target);
                let claimants = claims.entry(target.clone()).or_default();
                if claimants.last() != Some(&group_id) {
                    claimants.push(group_id);
                }
                winners.insert(
                    target,
                    (
                        FlattenedFile {
                            file: file_id,
                            group: group_id,
                            hash: file.hash,
                            size: file.size,
                        },
                        file.deleted,
                    ),
                );
            }
        }
    }

    let files = winners
        .into_iter()
        .filter(|(_, (_, deleted))| !deleted)
        .map(|(path, (file, _))| (path, file))
        .collect();
    Ok(FlattenedLoadout { files, claims })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::loadout::{GroupKind, Node, OverrideChange, Placement};
    use crate::sort::SortRule;

    fn path(s: &str) -> GamePath {
        GamePath::parse(s).unwrap()
    }

    fn h(s: &str) -> ContentHash {
        ContentHash::hash_bytes(s.as_bytes())
    }

    /// Loadout with one group per `(name, [(target, content)])`.
    fn build(groups: &[(&str, &[(&str, &str)])]) -> (Loadout, Vec<GroupId>) {
        let mut loadout = Loadout::new("test", "skyrim");
        let mods = loadout.mods_collection();
        let mut ids = Vec::new();
        for (name, files) in groups {
            let group = loadout.add_group(mods, *name, GroupKind::Mod).unwrap();
            let item = loadout.add_item(group, *name).unwrap();
            for (target, content) in *files {
                loadout
                    .add_file(item, path(target), h(content), content.len() as u64)
                    .unwrap();
            }
            ids.push(group);
        }
        (loadout, ids)
    }

    #[test]
    fn test_later_priority_wins() {
        let (mut loadout, ids) = build(&[
            ("one", &[("game/textures/a.dds", "one"), ("game/only-one.txt", "1")]),
            ("two", &[("game/textures/a.dds", "two")]),
        ]);
        let flat = flatten(&loadout).unwrap();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat.get(&path("game/textures/a.dds")).unwrap().hash, h("two"));
        let conflicts = flat.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[&path("game/textures/a.dds")], &[ids[0], ids[1]][..]);

        loadout.remove_groups(&[ids[1]]).unwrap();
        let flat = flatten(&loadout).unwrap();
        let winner = flat.get(&path("game/textures/a.dds")).unwrap();
        assert_eq!(winner.hash, h("one"));
        assert_eq!(winner.group, ids[0]);
        assert!(flat.conflicts().is_empty());
    }

    #[test]
    fn test_moving_changes_winner() {
        let (mut loadout, ids) = build(&[
            ("one", &[("game/a", "one")]),
            ("two", &[("game/a", "two")]),
        ]);
        loadout.move_group(ids[1], ids[0], Placement::Before).unwrap();
        assert_eq!(flatten(&loadout).unwrap().get(&path("game/a")).unwrap().hash, h("one"));
    }

    #[test]
    fn test_rules_beat_priority() {
        let (mut loadout, ids) = build(&[
            ("one", &[("game/a", "one")]),
            ("two", &[("game/a", "two")]),
        ]);
        loadout.add_rule(ids[0], SortRule::After(ids[1])).unwrap();
        assert_eq!(flatten(&loadout).unwrap().get(&path("game/a")).unwrap().hash, h("one"));
    }

    #[test]
    fn test_disabled_contributes_nothing() {
        let (mut loadout, ids) = build(&[
            ("one", &[("game/a", "one")]),
            ("two", &[("game/a", "two"), ("game/b", "two")]),
        ]);
        // `one` refers to the disabled group; sorting must still succeed
        loadout.add_rule(ids[0], SortRule::Before(ids[1])).unwrap();
        loadout.set_enabled(Node::Group(ids[1]), false).unwrap();

        let flat = flatten(&loadout).unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat.get(&path("game/a")).unwrap().hash, h("one"));

        let item = loadout.items_of(ids[0]).next().unwrap().0;
        loadout.set_enabled(Node::Item(item), false).unwrap();
        assert!(flatten(&loadout).unwrap().is_empty());
    }

    #[test]
    fn test_tombstone_removes_path() {
        let (mut loadout, _) = build(&[("one", &[("game/a", "one"), ("game/b", "b")])]);
        loadout.set_override(path("game/a"), OverrideChange::Removed);

        let flat = flatten(&loadout).unwrap();
        assert!(flat.get(&path("game/a")).is_none());
        assert!(flat.get(&path("game/b")).is_some());
    }

    #[test]
    fn test_game_files_sort_first() {
        let (mut loadout, _) = build(&[("mod", &[("game/a", "mod")])]);
        // Created after the mod, so it has the highest priority, but sorts First
        loadout.add_game_file(path("game/a"), h("vanilla"), 7);
        assert_eq!(flatten(&loadout).unwrap().get(&path("game/a")).unwrap().hash, h("mod"));
    }

    #[test]
    fn test_nested_locations_share_a_path() {
        use crate::game::LocationId;
        use std::path::PathBuf;

        let locations = BTreeMap::from([
            (LocationId::new("game").unwrap(), PathBuf::from("/g")),
            (LocationId::new("data").unwrap(), PathBuf::from("/g/Data")),
        ]);
        let installation = GameInstallation::new("test", locations, &[]).unwrap();
        let (loadout, ids) = build(&[
            ("outer", &[("game/Data/a.esp", "outer"), ("game/Game.exe", "exe")]),
            ("inner", &[("data/a.esp", "inner")]),
        ]);

        let flat = flatten_for(&loadout, &installation).unwrap();
        assert_eq!(flat.len(), 2);
        assert!(flat.get(&path("game/Data/a.esp")).is_none());
        assert_eq!(flat.get(&path("data/a.esp")).unwrap().hash, h("inner"));
        assert!(flat.get(&path("game/Game.exe")).is_some());
        assert_eq!(flat.conflicts()[&path("data/a.esp")], &[ids[0], ids[1]][..]);

        // Without an installation the two spellings stay apart
        assert_eq!(flatten(&loadout).unwrap().len(), 3);
    }

    #[test]
    fn test_cycle_surfaces() {
        let (mut loadout, ids) = build(&[("x", &[]), ("y", &[])]);
        loadout.add_rule(ids[0], SortRule::After(ids[1])).unwrap();
        loadout.add_rule(ids[1], SortRule::After(ids[0])).unwrap();
        assert!(matches!(flatten(&loadout), Err(Error::CyclicOrder { .. })));
    }
}
