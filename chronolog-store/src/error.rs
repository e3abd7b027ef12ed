//! Error type shared by the record store, snapshot I/O and collection router.

use std::path::{Path, PathBuf};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Filesystem operation failed
    Io { path: PathBuf, message: String },
    /// Encoding a snapshot fragment failed
    Serialization(String),
    /// A snapshot fragment could not be parsed
    Deserialization { path: PathBuf, message: String },
    /// A `name:ttl_minutes` collection pattern was malformed
    InvalidPattern(String),
    /// A uid or collection name cannot be used as a directory name
    InvalidKey(String),
    /// No registered pattern matches the collection name
    CollectionNotFound(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, message } => {
                write!(f, "I/O error at {}: {message}", path.display())
            }
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization { path, message } => {
                write!(f, "Deserialization error in {}: {message}", path.display())
            }
            StoreError::InvalidPattern(p) => write!(f, "invalid collection pattern: {p}"),
            StoreError::InvalidKey(k) => write!(f, "invalid key: {k:?}"),
            StoreError::CollectionNotFound(c) => write!(f, "collection {c} not found"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Reject keys that would escape or nest inside the storage tree.
///
/// Applies to both uids and collection names since both become
/// directory names under the storage root.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
