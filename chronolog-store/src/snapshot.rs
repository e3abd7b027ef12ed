//! Snapshot fragments on disk.
//!
//! Layout:
//! ```text
//! <root>/
//!   <collection>/
//!     <uid>/
//!       1718000000.json     [{"ts":N,"data":"..."}, ...]
//!       1718000060.json     records that became new since the previous flush
//! ```
//!
//! Fragments are append-only: a flush adds one file per changed uid and never
//! rewrites older ones. Each file is written to `<name>.tmp` and renamed into
//! place, so a crash mid-write leaves no truncated `*.json` behind.
//!
//! Loading replays every fragment of a uid in lexicographic file-name order;
//! the sorted insert re-establishes ordering and later files win on equal `ts`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::record::Record;

const FRAGMENT_EXT: &str = "json";

/// Counters from one collection load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub users: usize,
    pub files: usize,
    pub records: usize,
    pub files_skipped: usize,
}

/// Handle to a storage root directory.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    root: PathBuf,
}

impl SnapshotDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    pub fn user_dir(&self, collection: &str, uid: &str) -> PathBuf {
        self.collection_dir(collection).join(uid)
    }

    pub fn fragment_path(&self, collection: &str, uid: &str, flushed_at: i64) -> PathBuf {
        self.user_dir(collection, uid)
            .join(format!("{flushed_at}.{FRAGMENT_EXT}"))
    }

    /// Create the root directory if it does not exist yet.
    pub fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|e| StoreError::io(&self.root, e))
    }

    /// Names of every collection directory under the root, sorted.
    pub fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        list_subdirs(&self.root)
    }

    /// Write one uid's batch as the fragment for `flushed_at`.
    ///
    /// Two flushes inside the same wall-clock second target the same file;
    /// the earlier fragment's records are kept ahead of the new batch.
    pub fn write_fragment(
        &self,
        collection: &str,
        uid: &str,
        flushed_at: i64,
        records: &[Record],
    ) -> Result<PathBuf, StoreError> {
        let dir = self.user_dir(collection, uid);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let path = self.fragment_path(collection, uid, flushed_at);
        let mut batch = match read_fragment(&path) {
            Ok(existing) => existing,
            Err(StoreError::Io { .. }) if !path.exists() => Vec::new(),
            Err(e) => return Err(e),
        };
        batch.extend_from_slice(records);

        let bytes =
            serde_json::to_vec(&batch).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = path.with_extension(format!("{FRAGMENT_EXT}.tmp"));
        fs::write(&tmp, &bytes).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    /// Replay every fragment of `collection`, calling `apply` once per file.
    ///
    /// A missing collection directory is not an error. Unreadable or
    /// malformed fragments are logged and skipped.
    pub fn load_collection<F>(
        &self,
        collection: &str,
        mut apply: F,
    ) -> Result<LoadStats, StoreError>
    where
        F: FnMut(&str, Vec<Record>),
    {
        let dir = self.collection_dir(collection);
        let mut stats = LoadStats::default();
        if !dir.is_dir() {
            return Ok(stats);
        }

        for uid in list_subdirs(&dir)? {
            let user_dir = dir.join(&uid);
            let files = match list_fragments(&user_dir) {
                Ok(files) => files,
                Err(e) => {
                    log::error!("Skipping user {uid} in {collection}: {e}");
                    continue;
                }
            };
            stats.users += 1;

            for file in files {
                match read_fragment(&file) {
                    Ok(records) => {
                        stats.files += 1;
                        stats.records += records.len();
                        apply(&uid, records);
                    }
                    Err(e) => {
                        stats.files_skipped += 1;
                        log::error!("Skipping snapshot fragment: {e}");
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Remove a uid's directory and every fragment in it.
    pub fn remove_user(&self, collection: &str, uid: &str) -> Result<(), StoreError> {
        let dir = self.user_dir(collection, uid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }
}

fn read_fragment(path: &Path) -> Result<Vec<Record>, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn list_fragments(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == FRAGMENT_EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
