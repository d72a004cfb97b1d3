//! Error types for loadkeep_core.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using loadkeep_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the store, the codec and the synchronizer.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// No live container holds the requested content.
    #[error("Missing content: no archive holds {hash}")]
    MissingContent { hash: String },

    /// Apply found disk changes that were never ingested.
    #[error("{} unreviewed change(s) in installation {installation} must be ingested first: {}", .paths.len(), PathList(.paths))]
    ConflictRequiresIngest {
        installation: String,
        paths: Vec<String>,
    },

    /// Sort rules cannot be satisfied.
    #[error("Cyclic or unsatisfiable ordering between: {}", .items.join(", "))]
    CyclicOrder { items: Vec<String> },

    /// Writing a container failed.
    #[error("Failed to pack container {path}: {reason}")]
    Pack { path: PathBuf, reason: String },

    /// Container file is corrupted or has an unknown layout.
    #[error("Corrupted container at {path}: {reason}")]
    CorruptedContainer { path: PathBuf, reason: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Invalid game-relative path.
    #[error("Invalid game path {path:?}: {reason}")]
    InvalidGamePath { path: String, reason: String },

    /// Configuration could not be parsed or is inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// A loadout, group, item or installation id does not resolve.
    #[error("Unknown {kind}: {id}")]
    UnknownItem { kind: &'static str, id: String },

    /// Ingest needs a previous snapshot to diff against.
    #[error("No disk state recorded for installation {installation}")]
    NoDiskState { installation: String },

    /// Attempted to edit a read-only collection.
    #[error("Collection {name} is read-only")]
    ReadOnlyCollection { name: String },

    /// Compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },

    /// Metadata could not be (de)serialized.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// The operation observed its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Display helper that caps long path lists.
struct PathList<'a>(&'a [String]);

impl fmt::Display for PathList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 5;
        let shown: Vec<&str> = self.0.iter().take(SHOWN).map(String::as_str).collect();
        write!(f, "{}", shown.join(", "))?;
        if self.0.len() > SHOWN {
            write!(f, " (+{} more)", self.0.len() - SHOWN)?;
        }
        Ok(())
    }
}

impl Error {
    /// Create a MissingContent error.
    pub fn missing_content(hash: impl Into<String>) -> Self {
        Error::MissingContent { hash: hash.into() }
    }

    /// Create a ConflictRequiresIngest error.
    pub fn conflict_requires_ingest(installation: impl Into<String>, paths: Vec<String>) -> Self {
        Error::ConflictRequiresIngest {
            installation: installation.into(),
            paths,
        }
    }

    /// Create a CyclicOrder error.
    pub fn cyclic_order(items: Vec<String>) -> Self {
        Error::CyclicOrder { items }
    }

    /// Create a Pack error.
    pub fn pack(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Pack {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a CorruptedContainer error.
    pub fn corrupted_container(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedContainer {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an InvalidGamePath error.
    pub fn invalid_game_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidGamePath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnknownItem error.
    pub fn unknown_item(kind: &'static str, id: impl fmt::Display) -> Self {
        Error::UnknownItem {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a NoDiskState error.
    pub fn no_disk_state(installation: impl Into<String>) -> Self {
        Error::NoDiskState {
            installation: installation.into(),
        }
    }

    /// Create a ReadOnlyCollection error.
    pub fn read_only_collection(name: impl Into<String>) -> Self {
        Error::ReadOnlyCollection { name: name.into() }
    }

    /// Create a Compression error.
    pub fn compression(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Create an Io error from a message that has no underlying io::Error.
    pub fn io_other(reason: impl Into<String>) -> Self {
        Error::Io {
            source: std::io::Error::other(reason.into()),
        }
    }

    /// True for the recoverable "ingest first" signal raised by apply.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConflictRequiresIngest { .. })
    }

    /// True when the content store could not resolve a hash.
    pub fn is_missing_content(&self) -> bool {
        matches!(self, Error::MissingContent { .. })
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::invalid_config(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        Error::io_other(format!("failed to build worker pool: {}", err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::io_other(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_caps_paths() {
        let paths: Vec<String> = (0..8).map(|i| format!("game/file{}.esp", i)).collect();
        let err = Error::conflict_requires_ingest("skyrim", paths);
        let msg = err.to_string();
        assert!(msg.starts_with("8 unreviewed change(s) in installation skyrim"));
        assert!(msg.contains("game/file4.esp"));
        assert!(!msg.contains("game/file5.esp"));
        assert!(msg.ends_with("(+3 more)"));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_cyclic_order_lists_items() {
        let err = Error::cyclic_order(vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(
            err.to_string(),
            "Cyclic or unsatisfiable ordering between: X, Y"
        );
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_missing_content_predicate() {
        assert!(Error::missing_content("abc").is_missing_content());
        assert!(!Error::Cancelled.is_missing_content());
    }
}
