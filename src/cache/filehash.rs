//! The file-hash cache: a persistent `path -> content hash` mapping used to
//! decide whether files changed between invocations.

use crate::{error::Result, hash, utils};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
};

/// Format marker of the on-disk store.
const FORMAT_VERSION: &str = "strata-filehash-1";

#[derive(Debug, Serialize, Deserialize)]
struct FileHashStore {
    #[serde(rename = "_format")]
    format: String,
    files: BTreeMap<PathBuf, String>,
}

impl Default for FileHashStore {
    fn default() -> Self {
        Self { format: FORMAT_VERSION.to_string(), files: BTreeMap::new() }
    }
}

/// Persistent mapping from file path to content hash.
///
/// Reads are consistent snapshots; writers serialize on an internal lock.
/// Load failures degrade to an empty cache so every file is considered
/// changed, and write failures are reported to the caller who logs them
/// without failing the build.
#[derive(Debug)]
pub struct FileHashCache {
    path: PathBuf,
    files: RwLock<BTreeMap<PathBuf, String>>,
    dirty: AtomicBool,
}

impl FileHashCache {
    /// Loads the cache from `path`, falling back to an empty cache when the
    /// file is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let files = if path.exists() {
            match utils::read_json_file::<FileHashStore>(&path) {
                Ok(store) if store.format == FORMAT_VERSION => store.files,
                Ok(store) => {
                    warn!(
                        format = %store.format,
                        "unsupported file-hash cache format, treating every file as changed"
                    );
                    BTreeMap::new()
                }
                Err(err) => {
                    warn!(
                        %err,
                        "failed to read file-hash cache at \"{}\", treating every file as changed",
                        path.display()
                    );
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        trace!(entries = files.len(), "loaded file-hash cache from \"{}\"", path.display());
        Self { path, files: RwLock::new(files), dirty: AtomicBool::new(false) }
    }

    /// Whether `path` is absent from the cache or stored with a different
    /// hash.
    pub fn has_changed(&self, path: &Path, hash: &str) -> bool {
        let files = self.files.read().expect("file-hash cache lock poisoned");
        files.get(path).map(String::as_str) != Some(hash)
    }

    /// Returns the subset of the given `(path, hash)` pairs that changed.
    pub fn has_changed_any<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a Path, &'a str)>,
    ) -> Vec<PathBuf> {
        let files = self.files.read().expect("file-hash cache lock poisoned");
        entries
            .into_iter()
            .filter(|(path, hash)| files.get(*path).map(String::as_str) != Some(*hash))
            .map(|(path, _)| path.to_path_buf())
            .collect()
    }

    /// Hashes the file on disk and compares it against the stored hash.
    /// I/O failures count as changed.
    pub fn is_dirty_file(&self, path: &Path) -> bool {
        match hash::hash_file(path) {
            Ok(current) => self.has_changed(path, &current),
            Err(_) => true,
        }
    }

    pub fn add_or_update(&self, path: impl Into<PathBuf>, hash: impl Into<String>) {
        let mut files = self.files.write().expect("file-hash cache lock poisoned");
        files.insert(path.into(), hash.into());
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Whether the in-memory state diverged from disk since loading.
    pub fn mutated(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Atomically persists the cache when it was mutated.
    pub fn flush(&self) -> Result<()> {
        if !self.mutated() {
            return Ok(());
        }
        let files = self.files.read().expect("file-hash cache lock poisoned");
        let store =
            FileHashStore { format: FORMAT_VERSION.to_string(), files: files.clone() };
        utils::write_json_atomic(&store, &self.path)?;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }
}
