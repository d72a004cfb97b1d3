//! Configuration file parsing (`loadkeep.toml`).

use crate::container::CompressionMethod;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Config file name.
pub const CONFIG_FILE: &str = "loadkeep.toml";

/// Smallest and largest accepted container chunk sizes.
pub const MIN_CHUNK_SIZE: u32 = 4 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

/// Which [`ContentStore`](crate::ContentStore) implementation backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Chunked multi-file containers.
    #[default]
    Container,
    /// One compressed object file per hash.
    Loose,
}

/// Container packing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub chunk_size: u32,
    pub compression_level: i32,
    pub method: CompressionMethod,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            compression_level: 3,
            method: CompressionMethod::Zstd,
        }
    }
}

/// Worker pool sizing and I/O throttling.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads; 0 uses the available parallelism.
    pub threads: usize,
    /// Combined read throughput limit for hashing; 0 is unlimited.
    pub max_bytes_per_sec: u64,
}

/// Disk scanning behaviour.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Abort a scan on the first unreadable file instead of skipping it.
    pub fail_fast: bool,
}

/// One managed game installation.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationConfig {
    pub id: String,
    /// Location id (e.g. `game`, `saves`) to absolute root directory.
    pub locations: BTreeMap<String, PathBuf>,
    /// Gitignore-style patterns matched against `{location}/{path}`.
    #[serde(default)]
    pub ignore: Vec<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata directory (datastore log, hash cache).
    pub data_dir: PathBuf,
    /// Container directories; the first one receives new containers.
    pub storage_locations: Vec<PathBuf>,
    pub backend: Backend,
    pub container: ContainerConfig,
    pub workers: WorkerConfig,
    pub scan: ScanConfig,
    pub installations: Vec<InstallationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./loadkeep-data"),
            storage_locations: vec![PathBuf::from("./loadkeep-data/archives")],
            backend: Backend::default(),
            container: ContainerConfig::default(),
            workers: WorkerConfig::default(),
            scan: ScanConfig::default(),
            installations: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a file path.
    ///
    /// Returns the default config if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.storage_locations.is_empty() {
            return Err(Error::invalid_config(
                "at least one storage location is required",
            ));
        }

        let chunk_size = self.container.chunk_size;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(Error::invalid_config(format!(
                "container.chunk_size {} is outside {}..={}",
                chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }

        let mut seen = HashSet::new();
        for installation in &self.installations {
            if !seen.insert(installation.id.as_str()) {
                return Err(Error::invalid_config(format!(
                    "duplicate installation id: {}",
                    installation.id
                )));
            }
            if installation.locations.is_empty() {
                return Err(Error::invalid_config(format!(
                    "installation {} has no locations",
                    installation.id
                )));
            }
            for (location, root) in &installation.locations {
                if !root.is_absolute() {
                    return Err(Error::invalid_config(format!(
                        "location {} of installation {} must be absolute: {}",
                        location,
                        installation.id,
                        root.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Worker thread count with 0 resolved to the available parallelism.
    pub fn worker_threads(&self) -> usize {
        if self.workers.threads > 0 {
            self.workers.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    /// Find an installation by id.
    pub fn installation(&self, id: &str) -> Result<&InstallationConfig> {
        self.installations
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| Error::unknown_item("installation", id))
    }

    /// Path of the datastore log inside `data_dir`.
    pub fn datastore_path(&self) -> PathBuf {
        self.data_dir.join("metadata.log")
    }

    /// Path of the hash cache inside `data_dir`.
    pub fn hash_cache_path(&self) -> PathBuf {
        self.data_dir.join("hash_cache.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
data_dir = "/var/lib/loadkeep"
storage_locations = ["/mnt/fast/archives", "/mnt/slow/archives"]
backend = "container"

[container]
chunk_size = 65536
compression_level = 9
method = "lz4"

[workers]
threads = 2
max_bytes_per_sec = 1048576

[scan]
fail_fast = true

[[installations]]
id = "skyrim"
ignore = ["saves/**", "game/*.log"]

[installations.locations]
game = "/games/skyrim"
saves = "/home/user/saves"
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.storage_locations.len(), 2);
        assert_eq!(config.container.chunk_size, 65536);
        assert_eq!(config.container.method, CompressionMethod::Lz4);
        assert_eq!(config.worker_threads(), 2);
        assert!(config.scan.fail_fast);

        let skyrim = config.installation("skyrim").unwrap();
        assert_eq!(skyrim.locations["game"], PathBuf::from("/games/skyrim"));
        assert_eq!(skyrim.ignore.len(), 2);
        assert!(config.installation("oblivion").is_err());
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.backend, Backend::Container);
        assert_eq!(config.container.chunk_size, 1024 * 1024);
        assert_eq!(config.container.method, CompressionMethod::Zstd);
        assert!(!config.scan.fail_fast);
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.storage_locations.len(), 1);
    }

    #[test]
    fn test_rejects_bad_chunk_size() {
        let err = Config::parse("[container]\nchunk_size = 16\n").unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_rejects_relative_location_and_duplicates() {
        let relative = r#"
[[installations]]
id = "a"
[installations.locations]
game = "relative/dir"
"#;
        assert!(Config::parse(relative).is_err());

        let duplicate = r#"
[[installations]]
id = "a"
[installations.locations]
game = "/a"

[[installations]]
id = "a"
[installations.locations]
game = "/b"
"#;
        let err = Config::parse(duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate installation id"));
    }

    #[test]
    fn test_rejects_empty_storage() {
        assert!(Config::parse("storage_locations = []\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(Config::parse("backend = \"zip\"\n").is_err());
    }
}
