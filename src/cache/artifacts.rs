//! The artifact cache index: fingerprint → cached outputs and logs.

use crate::{error::Result, events::LogEntry, utils};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Current version of the index document.
pub const ARTIFACT_INDEX_VERSION: u64 = 1;

/// One cached artifact build.
///
/// `outputs` are file paths relative to the fingerprint's directory in the
/// content-addressed store. Unknown keys read from disk are preserved across
/// rewrites.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactCacheEntry {
    pub project: String,
    pub artifact: String,
    pub outputs: Vec<PathBuf>,
    pub stored_at: u64,
    pub last_access_at: u64,
    pub log_cache: Vec<LogEntry>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// The persistent index mapping fingerprints to cache entries.
///
/// Persisted as a single JSON document, written atomically via a temp file
/// and rename. Unknown top-level keys are preserved on rewrite.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArtifactCacheIndex {
    pub version: u64,
    pub entries: BTreeMap<String, ArtifactCacheEntry>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Default for ArtifactCacheIndex {
    fn default() -> Self {
        Self { version: ARTIFACT_INDEX_VERSION, entries: BTreeMap::new(), unknown: BTreeMap::new() }
    }
}

impl ArtifactCacheIndex {
    /// Reads the index from disk.
    pub fn read(path: &Path) -> Result<Self> {
        utils::read_json_file(path)
    }

    /// Reads the index, degrading to an empty one when the file is missing
    /// or unreadable; a corrupt index must never fail the build, it only
    /// costs cache hits.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::read(path) {
            Ok(index) if index.version == ARTIFACT_INDEX_VERSION => index,
            Ok(index) => {
                warn!(
                    version = index.version,
                    "unsupported artifact cache index version, starting empty"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    %err,
                    "failed to read artifact cache index at \"{}\", starting empty",
                    path.display()
                );
                Self::default()
            }
        }
    }

    /// Atomically writes the index to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        trace!(
            entries = self.entries.len(),
            "writing artifact cache index to \"{}\"",
            path.display()
        );
        utils::write_json_atomic(self, path)
    }

    pub fn entry(&self, fingerprint: &str) -> Option<&ArtifactCacheEntry> {
        self.entries.get(fingerprint)
    }

    pub fn entry_mut(&mut self, fingerprint: &str) -> Option<&mut ArtifactCacheEntry> {
        self.entries.get_mut(fingerprint)
    }

    pub fn insert(&mut self, fingerprint: impl Into<String>, entry: ArtifactCacheEntry) {
        self.entries.insert(fingerprint.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLevel;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn sample_entry() -> ArtifactCacheEntry {
        ArtifactCacheEntry {
            project: "app".into(),
            artifact: "dist".into(),
            outputs: vec![PathBuf::from("out.bin")],
            stored_at: 1000,
            last_access_at: 1000,
            log_cache: vec![LogEntry { level: EventLevel::Info, message: "packed".into() }],
            unknown: BTreeMap::new(),
        }
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts.json");

        let mut index = ArtifactCacheIndex::default();
        index.insert("fp1", sample_entry());
        index.write(&path).unwrap();

        let read = ArtifactCacheIndex::read(&path).unwrap();
        assert_eq!(read.version, ARTIFACT_INDEX_VERSION);
        assert_eq!(read.entry("fp1"), Some(&sample_entry()));
    }

    #[test]
    fn unknown_keys_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts.json");
        fs::write(
            &path,
            serde_json::json!({
                "version": 1,
                "entries": {
                    "fp1": {
                        "project": "app",
                        "artifact": "dist",
                        "outputs": ["out.bin"],
                        "stored_at": 1,
                        "last_access_at": 1,
                        "log_cache": [],
                        "builder_host": "ci-3"
                    }
                },
                "generator": "strata 0.1"
            })
            .to_string(),
        )
        .unwrap();

        let mut index = ArtifactCacheIndex::read(&path).unwrap();
        index.insert("fp2", sample_entry());
        index.write(&path).unwrap();

        let value: serde_json::Value = utils::read_json_file(&path).unwrap();
        assert_eq!(value["generator"], "strata 0.1");
        assert_eq!(value["entries"]["fp1"]["builder_host"], "ci-3");
        assert!(value["entries"]["fp2"].is_object());
    }

    #[test]
    fn corrupt_index_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts.json");
        fs::write(&path, b"{ definitely not json").unwrap();
        assert!(ArtifactCacheIndex::load_or_default(&path).is_empty());
    }

    #[test]
    fn missing_index_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ArtifactCacheIndex::load_or_default(&dir.path().join("nope.json")).is_empty());
    }
}
