//! Utility functions

use crate::error::{Result, StrataError};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

/// Canonicalize the path, platform-agnostic.
///
/// On windows this will ensure the path only consists of `\` separators and
/// does not start with the extended-length `\\?\` prefix.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| StrataError::io(err, path))
}

/// Returns the same path but canonicalized, if possible.
///
/// This takes care of symbolic-linked directories, e.g. temp dirs hosted
/// under `/var` on macOS which is a symlink to `/private/var`. Non-existing
/// paths are returned unchanged.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Strips `root` from `path` and returns the relative path.
pub fn strip_prefix<'a>(path: &'a Path, root: &Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}

/// Renders a path with `/` separators regardless of platform.
///
/// Relative paths rendered this way are used as stable keys in fingerprints
/// and cache files, so the output must not depend on the host OS.
pub fn slash_str(path: &Path) -> String {
    use path_slash::PathExt;
    path.to_slash_lossy().into_owned()
}

/// Returns an iterator over all files under `root`, or `root` itself if it is
/// a file. Follows symlinks.
pub fn files_iter(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().into())
}

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path).map_err(|err| StrataError::io(err, path))?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(Into::into)
}

/// Serializes the provided value to JSON and writes it to a file.
pub fn write_json_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    create_parent_dir_all(path)?;
    let file = fs::File::create(path).map_err(|err| StrataError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush().map_err(|err| StrataError::io(err, path))
}

/// Serializes the provided value to JSON and atomically replaces the file at
/// `path` with it.
///
/// The content is first written to a temp file in the same directory and then
/// moved into place with a rename, so readers never observe a partial write.
pub fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    create_parent_dir_all(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file =
        tempfile::NamedTempFile::new_in(dir).map_err(|err| StrataError::io(err, dir))?;
    {
        let mut writer = std::io::BufWriter::new(&mut file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush().map_err(|err| StrataError::io(err, path))?;
    }
    file.as_file().sync_all().map_err(|err| StrataError::io(err, path))?;
    file.persist(path).map_err(|err| StrataError::io(err.error, path))?;
    trace!("atomically wrote \"{}\"", path.display());
    Ok(())
}

/// Creates the parent directory of the `file` and all its ancestors if it
/// does not exist.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| StrataError::io(err, parent))?;
    }
    Ok(())
}

/// Moves a file, falling back to copy-and-remove when `from` and `to` live on
/// different filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    create_parent_dir_all(to)?;
    if fs::rename(from, to).is_err() {
        fs::copy(from, to).map_err(|err| StrataError::io(err, to))?;
        fs::remove_file(from).map_err(|err| StrataError::io(err, from))?;
    }
    Ok(())
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Milliseconds since the unix epoch of a file's modification time, `0` when
/// unavailable.
pub fn modified_millis(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn json_roundtrip_via_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");
        write_json_atomic(&Sample { value: 7 }, &path).unwrap();
        let read: Sample = read_json_file(&path).unwrap();
        assert_eq!(read, Sample { value: 7 });
    }

    #[test]
    fn move_file_replaces_target_dir_contents() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.bin");
        let to = dir.path().join("store").join("a.bin");
        fs::write(&from, b"payload").unwrap();
        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn slash_str_is_platform_agnostic() {
        let p = Path::new("src").join("a").join("b.txt");
        assert_eq!(slash_str(&p), "src/a/b.txt");
    }
}
