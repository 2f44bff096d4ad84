//! Content and fingerprint hashing.
//!
//! Everything that influences an artifact's outputs is reduced to hex
//! SHA-256 strings: individual file contents, ordered file sets and
//! build-configuration records. Fingerprints must be identical across
//! workspace locations and platforms, so file sets are keyed by
//! `/`-separated paths relative to the source-set root.

use crate::{
    error::{Result, StrataError},
    plugins::BuildConfig,
    utils,
};
use sha2::{Digest, Sha256};
use std::{fs, path::Path};

/// Hashes arbitrary bytes to a hex SHA-256 string.
pub fn hash_content(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    hex::encode(hasher.finalize())
}

/// Hashes the contents of the file at `path`.
pub fn hash_file(path: &Path) -> Result<String> {
    let content = fs::read(path).map_err(|err| StrataError::io(err, path))?;
    Ok(hash_content(content))
}

/// Hashes an ordered set of files below `root`.
///
/// For each relative path, in input order, the digest is fed
/// `relative-path NUL content-hash NUL`. The input order is the glob
/// resolution order of the owning source set, which keeps the result stable
/// across runs.
pub fn hash_file_set<I, P>(root: &Path, relative_paths: I) -> Result<String>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut hasher = Sha256::new();
    for rel in relative_paths {
        let rel = rel.as_ref();
        let file_hash = hash_file(&root.join(rel))?;
        hasher.update(utils::slash_str(rel).as_bytes());
        hasher.update([0u8]);
        hasher.update(file_hash.as_bytes());
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Combines already-computed hex hashes into one, separated by NUL bytes.
pub fn combine_hashes<I, S>(hashes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    let mut first = true;
    for hash in hashes {
        if !first {
            hasher.update([0u8]);
        }
        first = false;
        hasher.update(hash.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hashes the fingerprint-contributing fields of a build configuration.
///
/// Fields are sorted by name before hashing so that the declaration order in
/// the configuration record never leaks into the fingerprint.
pub fn hash_config(config: &dyn BuildConfig) -> String {
    let mut fields = config.fingerprint_fields();
    fields.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut hasher = Sha256::new();
    hasher.update(config.config_type().as_bytes());
    hasher.update([0u8]);
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// sha256 of the empty input.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[derive(Debug)]
    struct TestConfig(Vec<(&'static str, &'static str)>);

    impl BuildConfig for TestConfig {
        fn config_type(&self) -> &str {
            "test"
        }

        fn fingerprint_fields(&self) -> Vec<(String, String)> {
            self.0.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        }
    }

    #[test]
    fn known_content_hash() {
        assert_eq!(
            hash_content("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(hash_content(""), EMPTY_SHA256);
    }

    #[test]
    fn empty_file_set_hashes_to_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let hash = hash_file_set(dir.path(), Vec::<&Path>::new()).unwrap();
        assert_eq!(hash, EMPTY_SHA256);
    }

    #[test]
    fn file_set_hash_depends_on_relative_path_and_content() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for dir in [&a, &b] {
            fs::create_dir_all(dir.path().join("src")).unwrap();
            fs::write(dir.path().join("src/a.txt"), "hello").unwrap();
        }

        let rel = [Path::new("src/a.txt")];
        // identical relative layout and contents, different roots
        assert_eq!(
            hash_file_set(a.path(), rel).unwrap(),
            hash_file_set(b.path(), rel).unwrap()
        );

        fs::write(b.path().join("src/a.txt"), "world").unwrap();
        assert_ne!(
            hash_file_set(a.path(), rel).unwrap(),
            hash_file_set(b.path(), rel).unwrap()
        );
    }

    #[test]
    fn config_hash_ignores_field_order() {
        let fwd = TestConfig(vec![("optimize", "true"), ("target", "release")]);
        let rev = TestConfig(vec![("target", "release"), ("optimize", "true")]);
        assert_eq!(hash_config(&fwd), hash_config(&rev));

        let other = TestConfig(vec![("optimize", "false"), ("target", "release")]);
        assert_ne!(hash_config(&fwd), hash_config(&other));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let ab = combine_hashes(["aa", "bb"]);
        let ba = combine_hashes(["bb", "aa"]);
        assert_ne!(ab, ba);
        // not the same as concatenation without separator
        assert_ne!(ab, hash_content("aabb"));
    }
}
