//! Game installations and game-relative paths.

use crate::config::InstallationConfig;
use crate::error::{Error, Result};
use crate::hash_cache::normalize_path;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Named root of an installation (e.g. `game`, `saves`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        // Validate id - it becomes the first segment of every GamePath
        if id.is_empty() || id.contains('/') || id.contains('\\') || id == "." || id == ".." {
            return Err(Error::invalid_game_path(
                id,
                "location id must be a single non-empty segment",
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file location independent of where the game is installed.
///
/// Ordered by `(location, path)`; serialized as `"{location}/{path}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GamePath {
    location: LocationId,
    path: String,
}

impl GamePath {
    /// Build a path, normalizing separators.
    ///
    /// Backslashes become `/`, leading/trailing and repeated separators are
    /// dropped. `.` and `..` segments are rejected.
    pub fn new(location: LocationId, path: &str) -> Result<Self> {
        let path = normalize(path)?;
        Ok(Self { location, path })
    }

    /// Parse the `"{location}/{path}"` form.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.replace('\\', "/");
        let (location, path) = s
            .trim_start_matches('/')
            .split_once('/')
            .ok_or_else(|| Error::invalid_game_path(s.clone(), "expected {location}/{path}"))?;
        Self::new(LocationId::new(location)?, path)
    }

    pub fn location(&self) -> &LocationId {
        &self.location
    }

    /// Normalized path relative to the location root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Parent directories from the deepest up, excluding the location root.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        let path = self.path.as_str();
        path.match_indices('/')
            .map(move |(i, _)| &path[..i])
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
    }
}

fn normalize(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" => continue,
            "." | ".." => {
                return Err(Error::invalid_game_path(
                    path,
                    "relative segments are not allowed",
                ));
            }
            s if s.contains('\0') => {
                return Err(Error::invalid_game_path(path, "contains NUL byte"));
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(Error::invalid_game_path(path, "path is empty"));
    }
    Ok(segments.join("/"))
}

impl fmt::Display for GamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location, self.path)
    }
}

impl Serialize for GamePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GamePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GamePath::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Maps between absolute paths and [`GamePath`]s for one installation.
#[derive(Debug, Clone)]
pub struct GameInstallation {
    id: String,
    locations: BTreeMap<LocationId, PathBuf>,
    ignore: Gitignore,
}

impl GameInstallation {
    /// Build an installation from location roots and gitignore-style patterns.
    pub fn new(
        id: impl Into<String>,
        locations: BTreeMap<LocationId, PathBuf>,
        patterns: &[String],
    ) -> Result<Self> {
        let id = id.into();
        let ignore = if patterns.is_empty() {
            Gitignore::empty()
        } else {
            let mut builder = GitignoreBuilder::new("");
            for pattern in patterns {
                builder.add_line(None, pattern)?;
            }
            builder.build()?
        };
        Ok(Self {
            id,
            locations,
            ignore,
        })
    }

    pub fn from_config(config: &InstallationConfig) -> Result<Self> {
        let locations = config
            .locations
            .iter()
            .map(|(id, root)| Ok((LocationId::new(id.as_str())?, normalize_path(root)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Self::new(config.id.clone(), locations, &config.ignore)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn locations(&self) -> &BTreeMap<LocationId, PathBuf> {
        &self.locations
    }

    /// Root directory of a location.
    pub fn root(&self, location: &LocationId) -> Result<&Path> {
        self.locations
            .get(location)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::unknown_item("location", location))
    }

    /// True if `path` is a location root of this installation.
    pub fn is_root(&self, path: &Path) -> bool {
        self.locations.values().any(|root| root == path)
    }

    /// Absolute path of a game path.
    pub fn to_absolute(&self, game_path: &GamePath) -> Result<PathBuf> {
        let mut abs = self.root(game_path.location())?.to_path_buf();
        for segment in game_path.path().split('/') {
            abs.push(segment);
        }
        Ok(abs)
    }

    /// Game path of an absolute path, if it lies under a location.
    ///
    /// Nested locations resolve to the deepest root.
    pub fn to_game_path(&self, abs: &Path) -> Option<GamePath> {
        let (location, rest) = self
            .locations
            .iter()
            .filter_map(|(id, root)| abs.strip_prefix(root).ok().map(|rest| (id, rest, root)))
            .max_by_key(|(_, _, root)| root.components().count())
            .map(|(id, rest, _)| (id, rest))?;

        let mut segments = Vec::new();
        for component in rest.components() {
            match component {
                Component::Normal(s) => segments.push(s.to_str()?),
                _ => return None,
            }
        }
        GamePath::new(location.clone(), &segments.join("/")).ok()
    }

    /// The game path a scan reports for the file `game_path` names.
    ///
    /// With nested locations one file is reachable through several ids
    /// (`game/Data/a.esp` and `data/a.esp`); this returns the deepest.
    /// Paths on locations this installation lacks come back unchanged.
    pub fn canonical(&self, game_path: &GamePath) -> GamePath {
        self.to_absolute(game_path)
            .ok()
            .and_then(|abs| self.to_game_path(&abs))
            .unwrap_or_else(|| game_path.clone())
    }

    /// True if administrative ignore patterns exclude this path.
    pub fn is_ignored(&self, game_path: &GamePath) -> bool {
        let rel = game_path.to_string();
        self.ignore
            .matched_path_or_any_parents(Path::new(&rel), false)
            .is_ignore()
    }
}
