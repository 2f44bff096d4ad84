//! Builds artifacts through their blueprints, backed by the
//! content-addressed cache.
//!
//! The flow for an artifact-building job is: compute the fingerprint from
//! the project's source sets and the blueprint configuration, look it up in
//! the cache index, and either replay the cached result or run the blueprint
//! and store what it produced.

use crate::{
    cache::{ArtifactCacheEntry, ArtifactCacheIndex},
    error::{Result, StrataError},
    events::{EventBus, EventLevel, EventPayload, LogSink},
    hash,
    plugins::{ArtifactBlueprint, ArtifactLink, BuildConfig, DependencyResolution},
    utils,
    workspace::{Artifact, Project, Workspace},
};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Result of [`ArtifactManager::build_from_dependencies`].
#[derive(Debug)]
pub enum BuildOutcome {
    /// Cache hit; the blueprint was not invoked.
    Cached { fingerprint: String, outputs: Vec<PathBuf> },
    /// The blueprint ran to completion.
    Built { outputs: Vec<PathBuf> },
    /// The blueprint failed; the cache is unchanged.
    Failed { cause: StrataError },
}

/// Computes the fingerprint of an artifact build: the configuration hash
/// combined with the name-ordered source-set fingerprints of the owning
/// project.
pub fn artifact_fingerprint(project: &Project, config: &dyn BuildConfig) -> Result<String> {
    let source_fingerprints: Vec<String> = project
        .source_sets()
        .map(|source_set| source_set.fingerprint())
        .collect::<Result<_>>()?;
    Ok(hash::combine_hashes([
        hash::hash_config(config),
        hash::combine_hashes(source_fingerprints),
    ]))
}

/// Resolves every declared dependency of an artifact, collecting implied job
/// edges and inter-artifact links.
pub fn resolve_artifact_dependencies(artifact: &Artifact) -> Result<DependencyResolution> {
    let mut resolution = DependencyResolution::new(artifact.project(), artifact.name());
    for dependency in artifact.dependencies() {
        dependency.resolve(&mut resolution)?;
    }
    Ok(resolution)
}

/// Owns the artifact cache for one invocation and drives blueprint
/// execution.
#[derive(Debug)]
pub struct ArtifactManager {
    events: Arc<EventBus>,
    index_path: PathBuf,
    store_dir: PathBuf,
    index: Mutex<ArtifactCacheIndex>,
    dirty: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
    links: Mutex<Vec<ArtifactLink>>,
}

impl ArtifactManager {
    pub fn new(
        events: Arc<EventBus>,
        index_path: impl Into<PathBuf>,
        store_dir: impl Into<PathBuf>,
    ) -> Self {
        let index_path = index_path.into();
        let index = ArtifactCacheIndex::load_or_default(&index_path);
        Self {
            events,
            index_path,
            store_dir: store_dir.into(),
            index: Mutex::new(index),
            dirty: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    /// A manager using the workspace's standard cache locations.
    pub fn for_workspace(events: Arc<EventBus>, workspace: &Workspace) -> Self {
        Self::new(events, workspace.artifact_index_path(), workspace.artifact_store_dir())
    }

    /// Builds an artifact, short-circuiting through the cache when possible.
    ///
    /// With `invalidate` set the cache lookup is skipped and the entry is
    /// rewritten after a successful build.
    pub fn build_from_dependencies(
        &self,
        blueprint: &dyn ArtifactBlueprint,
        artifact: &Artifact,
        project: &Project,
        config: &dyn BuildConfig,
        invalidate: bool,
    ) -> Result<BuildOutcome> {
        let fingerprint = artifact_fingerprint(project, config)?;
        let _flight = InFlightGuard::acquire(self, artifact, &fingerprint)?;

        if !invalidate {
            if let Some(outputs) = self.try_replay(artifact, &fingerprint) {
                return Ok(BuildOutcome::Cached { fingerprint, outputs });
            }
        }
        self.events.emit(
            EventLevel::Debug,
            EventPayload::CacheMiss {
                artifact: artifact.build_job_id().to_string(),
                fingerprint: fingerprint.clone(),
            },
        );

        let resolution = resolve_artifact_dependencies(artifact)?;
        self.links.lock().expect("artifact links lock poisoned").extend(
            resolution.links().iter().cloned(),
        );

        let log = LogSink::new(self.events.clone(), self.events.current_context());
        debug!(artifact = %artifact.build_job_id(), %fingerprint, "running blueprint");
        let outputs = match blueprint.run(artifact, project, config, &log) {
            Ok(outputs) => outputs,
            Err(err) => {
                return Ok(BuildOutcome::Failed {
                    cause: StrataError::Blueprint {
                        artifact: artifact.build_job_id().to_string(),
                        source: Box::new(err),
                    },
                });
            }
        };
        if let Some(missing) = outputs.iter().find(|path| !path.exists()) {
            return Ok(BuildOutcome::Failed {
                cause: StrataError::InvalidBlueprintOutput {
                    artifact: artifact.build_job_id().to_string(),
                    output: missing.clone(),
                },
            });
        }

        let entries = log.entries();
        artifact.set_log_cache(entries.clone());

        match self.store_outputs(&fingerprint, &outputs) {
            Ok(stored) => {
                let now = utils::unix_millis();
                let entry = ArtifactCacheEntry {
                    project: project.id().to_string(),
                    artifact: artifact.name().to_string(),
                    outputs: stored.iter().map(|(relative, _)| relative.clone()).collect(),
                    stored_at: now,
                    last_access_at: now,
                    log_cache: entries,
                    unknown: Default::default(),
                };
                self.index
                    .lock()
                    .expect("artifact cache lock poisoned")
                    .insert(fingerprint, entry);
                self.dirty.store(true, Ordering::Relaxed);
                Ok(BuildOutcome::Built {
                    outputs: stored.into_iter().map(|(_, absolute)| absolute).collect(),
                })
            }
            Err(err) => {
                // a failed store only costs the cache entry, never the build
                warn!(%err, "failed to store artifact outputs in the cache");
                Ok(BuildOutcome::Built { outputs })
            }
        }
    }

    /// Attempts a cache hit: the entry must exist and every referenced
    /// output file must still be present in the store.
    fn try_replay(&self, artifact: &Artifact, fingerprint: &str) -> Option<Vec<PathBuf>> {
        let mut index = self.index.lock().expect("artifact cache lock poisoned");
        let entry = index.entry_mut(fingerprint)?;
        let dir = self.store_dir.join(fingerprint);
        let outputs: Vec<PathBuf> =
            entry.outputs.iter().map(|relative| dir.join(relative)).collect();
        if !outputs.iter().all(|path| path.exists()) {
            debug!(%fingerprint, "cache entry has missing outputs, ignoring");
            return None;
        }

        entry.last_access_at = utils::unix_millis();
        let log_cache = entry.log_cache.clone();
        drop(index);
        self.dirty.store(true, Ordering::Relaxed);

        self.events.emit(
            EventLevel::Debug,
            EventPayload::CacheHit {
                artifact: artifact.build_job_id().to_string(),
                fingerprint: fingerprint.to_string(),
            },
        );
        // replay the recorded logs verbatim under the current context
        for entry in &log_cache {
            self.events.emit(
                entry.level,
                EventPayload::ScriptLog { message: entry.message.clone() },
            );
        }
        artifact.set_log_cache(log_cache);
        Some(outputs)
    }

    /// Moves blueprint outputs into the content-addressed store, returning
    /// `(relative, absolute)` path pairs.
    fn store_outputs(
        &self,
        fingerprint: &str,
        outputs: &[PathBuf],
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        let dir = self.store_dir.join(fingerprint);
        std::fs::create_dir_all(&dir).map_err(|err| StrataError::io(err, &dir))?;

        let mut seen = HashSet::new();
        let mut stored = Vec::with_capacity(outputs.len());
        for output in outputs {
            let name = output
                .file_name()
                .ok_or_else(|| {
                    StrataError::msg(format!(
                        "blueprint output \"{}\" has no file name",
                        output.display()
                    ))
                })?
                .to_owned();
            if !seen.insert(name.clone()) {
                return Err(StrataError::msg(format!(
                    "blueprint produced two outputs named \"{}\"",
                    Path::new(&name).display()
                )));
            }
            let target = dir.join(&name);
            utils::move_file(output, &target)?;
            stored.push((PathBuf::from(&name), target));
        }
        Ok(stored)
    }

    /// Inter-artifact links recorded by dependency resolution so far.
    pub fn links(&self) -> Vec<ArtifactLink> {
        self.links.lock().expect("artifact links lock poisoned").clone()
    }

    /// Whether the index diverged from disk.
    pub fn mutated(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Atomically writes the index when it was mutated.
    pub fn flush(&self) -> Result<()> {
        if !self.mutated() {
            return Ok(());
        }
        self.index.lock().expect("artifact cache lock poisoned").write(&self.index_path)?;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Marks a fingerprint as being built; no two concurrent blueprint
/// invocations may share one.
struct InFlightGuard<'a> {
    manager: &'a ArtifactManager,
    fingerprint: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(
        manager: &'a ArtifactManager,
        artifact: &Artifact,
        fingerprint: &str,
    ) -> Result<Self> {
        let mut in_flight = manager.in_flight.lock().expect("in-flight lock poisoned");
        if !in_flight.insert(fingerprint.to_string()) {
            return Err(StrataError::ConcurrentArtifactBuild(
                artifact.build_job_id().to_string(),
            ));
        }
        Ok(Self { manager, fingerprint: fingerprint.to_string() })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.fingerprint);
    }
}
