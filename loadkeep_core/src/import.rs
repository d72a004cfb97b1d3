//! Import an unpacked mod directory into a loadout.

use crate::error::{Error, Result};
use crate::game::{GamePath, LocationId};
use crate::loadout::{GroupId, GroupKind, Loadout};
use crate::store::{BackupEntry, ContentStore};
use crate::throttle::CancellationToken;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub group: GroupId,
    pub files: usize,
    pub bytes: u64,
    /// Files whose content was not archived before.
    pub stored: usize,
}

/// Archive every file under `dir` and add them as a new mod group.
///
/// Each file targets `location/<path relative to dir>`. The loadout is
/// changed in memory only; the caller persists it.
pub fn import_directory(
    store: &dyn ContentStore,
    loadout: &mut Loadout,
    group_name: &str,
    dir: &Path,
    location: &LocationId,
    cancel: &CancellationToken,
) -> Result<ImportReport> {
    if !fs::metadata(dir)?.is_dir() {
        return Err(Error::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Not a directory: {}", dir.display()),
            ),
        });
    }

    let mut files = Vec::new();
    collect_files(dir, "", &mut files)?;

    let mut entries = Vec::with_capacity(files.len());
    let mut targets = Vec::with_capacity(files.len());
    for (relative, path) in &files {
        cancel.check()?;
        let entry = BackupEntry::from_path(path)?;
        targets.push((GamePath::new(location.clone(), relative)?, entry.hash, entry.size));
        entries.push(entry);
    }
    let bytes: u64 = entries.iter().map(|e| e.size).sum();
    let backup = store.backup_files(entries, cancel)?;

    let collection = loadout.mods_collection();
    let group = loadout.add_group(collection, group_name, GroupKind::Mod)?;
    let item = loadout.add_item(group, group_name)?;
    for (target, hash, size) in targets {
        loadout.add_file(item, target, hash, size)?;
    }

    tracing::info!(
        group = group_name,
        files = files.len(),
        bytes,
        stored = backup.stored.len(),
        "imported directory"
    );
    Ok(ImportReport {
        group,
        files: files.len(),
        bytes,
        stored: backup.stored.len(),
    })
}

/// Collect `(relative path, absolute path)` of every file, recursively.
fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    let walker = ignore::WalkBuilder::new(dir)
        .max_depth(Some(1)) // Only immediate children
        .hidden(false) // Include hidden files
        .git_ignore(false)
        .ignore(false)
        .parents(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    for entry in walker {
        let entry = entry?;
        let entry_path = entry.path();

        // Skip the directory itself
        if entry_path == dir {
            continue;
        }

        let file_name = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::invalid_game_path(entry_path.display().to_string(), "file name is not UTF-8")
            })?;
        let relative = if prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", prefix, file_name)
        };

        let metadata = fs::symlink_metadata(entry_path)?;
        if metadata.is_symlink() {
            return Err(Error::invalid_game_path(
                relative,
                "symlinks are not supported in mod directories",
            ));
        } else if metadata.is_dir() {
            collect_files(entry_path, &relative, out)?;
        } else if metadata.is_file() {
            out.push((relative, entry_path.to_path_buf()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::PackOptions;
    use crate::datastore::{Datastore, MemoryDatastore};
    use crate::hash::ContentHash;
    use crate::store::ContainerStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> ContainerStore {
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        ContainerStore::new(
            datastore,
            vec![temp.path().join("archives")],
            PackOptions::default(),
            pool,
        )
        .unwrap()
    }

    #[test]
    fn test_import_directory() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let mod_dir = temp.path().join("SkyUI");
        fs::create_dir_all(mod_dir.join("interface/skyui")).unwrap();
        fs::write(mod_dir.join("SkyUI.esp"), b"plugin").unwrap();
        fs::write(mod_dir.join("interface/skyui/config.txt"), b"config").unwrap();
        fs::write(mod_dir.join(".hidden"), b"hidden").unwrap();

        let mut loadout = Loadout::new("main", "skyrim");
        let location = LocationId::new("data").unwrap();
        let report = import_directory(
            &store,
            &mut loadout,
            "SkyUI",
            &mod_dir,
            &location,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(report.files, 3);
        assert_eq!(report.stored, 3);
        assert_eq!(loadout.find_group("SkyUI"), Some(report.group));

        let mut targets: Vec<String> = loadout.files().values().map(|f| f.target.to_string()).collect();
        targets.sort();
        assert_eq!(
            targets,
            vec!["data/.hidden", "data/SkyUI.esp", "data/interface/skyui/config.txt"]
        );
        assert!(store.have_file(&ContentHash::hash_bytes(b"config")).unwrap());

        // Same content again: new group, nothing new stored
        let again = import_directory(
            &store,
            &mut loadout,
            "SkyUI copy",
            &mod_dir,
            &location,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(again.stored, 0);
        assert_eq!(loadout.groups().len(), 2);
    }

    #[test]
    fn test_import_rejects_file() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let file = temp.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        let mut loadout = Loadout::new("main", "skyrim");
        let result = import_directory(
            &store,
            &mut loadout,
            "x",
            &file,
            &LocationId::new("data").unwrap(),
            &CancellationToken::new(),
        );
        assert!(result.is_err());
        assert!(loadout.groups().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_import_rejects_symlink() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let mod_dir = temp.path().join("mod");
        fs::create_dir_all(&mod_dir).unwrap();
        fs::write(temp.path().join("target"), b"t").unwrap();
        std::os::unix::fs::symlink(temp.path().join("target"), mod_dir.join("link")).unwrap();

        let mut loadout = Loadout::new("main", "skyrim");
        let err = import_directory(
            &store,
            &mut loadout,
            "mod",
            &mod_dir,
            &LocationId::new("data").unwrap(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }
}
