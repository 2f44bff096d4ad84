//! Source sets: deterministically ordered file collections derived from
//! globs over a root directory.

use crate::{
    error::{Result, StrataError},
    hash, utils,
};
use glob::Pattern;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

/// A resolved file collection below a root directory.
///
/// Include globs select files, exclude globs drop them again, both matched
/// against `/`-separated paths relative to the root. Resolution is computed
/// once and cached; the enumeration order is sorted lexicographically by
/// relative path so the fingerprint is stable for a given filesystem state.
#[derive(Debug)]
pub struct SourceSet {
    name: String,
    root: PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    resolved: OnceCell<Vec<PathBuf>>,
}

impl SourceSet {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: utils::canonicalized(root.into()),
            includes: Vec::new(),
            excludes: Vec::new(),
            resolved: OnceCell::new(),
        }
    }

    /// Adds an include glob. An empty include list matches every file under
    /// the root.
    #[must_use]
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    /// Adds an exclude glob, applied after the includes.
    #[must_use]
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the set to its ordered list of root-relative file paths.
    ///
    /// Fails with `configuration/missing-source` when the root directory does
    /// not exist.
    pub fn resolve(&self) -> Result<&[PathBuf]> {
        self.resolved
            .get_or_try_init(|| {
                if !self.root.is_dir() {
                    return Err(StrataError::MissingSourceRoot(self.root.clone()));
                }
                let includes = compile_patterns(&self.includes)?;
                let excludes = compile_patterns(&self.excludes)?;

                let mut files: Vec<(String, PathBuf)> = utils::files_iter(&self.root)
                    .filter_map(|path| {
                        let rel = utils::strip_prefix(&path, &self.root).to_path_buf();
                        let key = utils::slash_str(&rel);
                        let included =
                            includes.is_empty() || includes.iter().any(|p| p.matches(&key));
                        let excluded = excludes.iter().any(|p| p.matches(&key));
                        (included && !excluded).then_some((key, rel))
                    })
                    .collect();
                files.sort_by(|(a, _), (b, _)| a.cmp(b));
                files.dedup_by(|(a, _), (b, _)| a == b);
                trace!(
                    source_set = %self.name,
                    files = files.len(),
                    "resolved source set under \"{}\"",
                    self.root.display()
                );
                Ok(files.into_iter().map(|(_, rel)| rel).collect())
            })
            .map(Vec::as_slice)
    }

    /// SHA-256 fingerprint over the ordered per-file content hashes.
    pub fn fingerprint(&self) -> Result<String> {
        hash::hash_file_set(&self.root, self.resolve()?)
    }

    /// The most recent modification time of any file in the set, in
    /// milliseconds since the unix epoch. `0` for an empty set.
    pub fn last_modified_millis(&self) -> Result<u64> {
        Ok(self
            .resolve()?
            .iter()
            .map(|rel| utils::modified_millis(&self.root.join(rel)))
            .max()
            .unwrap_or_default())
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|err| StrataError::InvalidSourcePattern {
                pattern: pattern.clone(),
                message: err.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("src/main.c"), "int main() {}").unwrap();
        fs::write(root.join("src/util.c"), "void util() {}").unwrap();
        fs::write(root.join("src/util.h"), "void util();").unwrap();
        fs::write(root.join("src/nested/deep.c"), "// deep").unwrap();
        fs::write(root.join("notes.txt"), "notes").unwrap();
    }

    #[test]
    fn resolution_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let set = SourceSet::new("c-sources", dir.path())
            .include("src/**")
            .exclude("**/*.h")
            .exclude("src/nested/**");
        let files: Vec<String> =
            set.resolve().unwrap().iter().map(|p| utils::slash_str(p)).collect();
        assert_eq!(files, vec!["src/main.c", "src/util.c"]);
    }

    #[test]
    fn empty_includes_match_everything() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let set = SourceSet::new("all", dir.path());
        assert_eq!(set.resolve().unwrap().len(), 5);
    }

    #[test]
    fn missing_root_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let set = SourceSet::new("ghost", dir.path().join("does-not-exist"));
        let err = set.resolve().unwrap_err();
        assert_eq!(err.kind(), "configuration/missing-source");
    }

    #[test]
    fn empty_set_fingerprint_is_hash_of_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let set = SourceSet::new("empty", dir.path()).include("*.nothing");
        assert_eq!(
            set.fingerprint().unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_is_independent_of_root_location() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        populate(a.path());
        populate(b.path());

        let fp_a = SourceSet::new("s", a.path()).include("src/**").fingerprint().unwrap();
        let fp_b = SourceSet::new("s", b.path()).include("src/**").fingerprint().unwrap();
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn fingerprint_tracks_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let before = SourceSet::new("s", dir.path()).include("src/**").fingerprint().unwrap();
        fs::write(dir.path().join("src/main.c"), "int main() { return 1; }").unwrap();
        let after = SourceSet::new("s", dir.path()).include("src/**").fingerprint().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn last_modified_covers_the_whole_set() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let set = SourceSet::new("s", dir.path()).include("**/*.c");
        assert!(set.last_modified_millis().unwrap() > 0);

        let empty = SourceSet::new("none", dir.path()).include("*.nothing");
        assert_eq!(empty.last_modified_millis().unwrap(), 0);
    }
}
