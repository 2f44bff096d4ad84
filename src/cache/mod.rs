//! Persistent caches: file content hashes and the artifact cache index.

mod artifacts;
mod filehash;

pub use artifacts::{ArtifactCacheEntry, ArtifactCacheIndex, ARTIFACT_INDEX_VERSION};
pub use filehash::FileHashCache;
