//! The engine facade: binds the workspace to the registry, graph, executor
//! and caches, and drives one build invocation.

use crate::{
    artifacts::{self, ArtifactManager, BuildOutcome},
    cache::FileHashCache,
    error::{Result, StrataError},
    events::EventBus,
    execute::Executor,
    graph::ExecutionGraph,
    job::{Action, ComponentId, Job, JobId},
    plugins::ExtensionManager,
    registry::JobRegistry,
    workspace::Workspace,
};
use std::sync::Arc;

/// Process phase of one invocation; transitions are strictly forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ExecutionStage {
    Setup,
    Discovery,
    PluginLoading,
    Configuration,
    Runtime,
    Shutdown,
}

impl ExecutionStage {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionStage::Setup => "Setup",
            ExecutionStage::Discovery => "Discovery",
            ExecutionStage::PluginLoading => "PluginLoading",
            ExecutionStage::Configuration => "Configuration",
            ExecutionStage::Runtime => "Runtime",
            ExecutionStage::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Owns the service bundle for one invocation and drives builds against a
/// configured workspace.
#[derive(Debug)]
pub struct Engine {
    workspace: Arc<Workspace>,
    extensions: Arc<ExtensionManager>,
    events: Arc<EventBus>,
    artifacts: Arc<ArtifactManager>,
    file_hashes: Arc<FileHashCache>,
    stage: ExecutionStage,
    workers: usize,
}

impl Engine {
    /// Binds a populated workspace to fresh caches under its data
    /// directory. Filter hooks are applied here, before the workspace is
    /// frozen.
    pub fn new(
        mut workspace: Workspace,
        extensions: ExtensionManager,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        workspace.apply_filter_hooks();
        let artifacts = Arc::new(ArtifactManager::for_workspace(events.clone(), &workspace));
        let file_hashes = Arc::new(FileHashCache::load(workspace.file_hash_cache_path()));
        Ok(Self {
            workspace: Arc::new(workspace),
            extensions: Arc::new(extensions),
            events,
            artifacts,
            file_hashes,
            stage: ExecutionStage::Setup,
            workers: num_cpus::get(),
        })
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn artifact_manager(&self) -> &Arc<ArtifactManager> {
        &self.artifacts
    }

    /// The file-hash cache used by configuration loaders to skip
    /// recompiling unchanged scripts; flushed with the build when mutated.
    pub fn file_hash_cache(&self) -> &Arc<FileHashCache> {
        &self.file_hashes
    }

    pub fn stage(&self) -> ExecutionStage {
        self.stage
    }

    /// Moves to a later (or the same) stage; moving backwards is an
    /// internal error.
    pub fn advance_stage(&mut self, to: ExecutionStage) -> Result<()> {
        if to < self.stage {
            return Err(StrataError::StageRegression {
                from: self.stage.name(),
                to: to.name(),
            });
        }
        if to != self.stage {
            trace!(from = %self.stage, to = %to, "advancing execution stage");
            self.stage = to;
        }
        Ok(())
    }

    /// Sets the number of worker threads for blocking jobs.
    ///
    /// # Panics
    ///
    /// If `workers == 0`.
    pub fn set_workers(&mut self, workers: usize) {
        assert!(workers > 0);
        self.workers = workers;
    }

    /// Resolves `target` to a layered plan and executes it.
    ///
    /// `invalidate` bypasses artifact cache lookups for this build. Both
    /// caches are flushed on the way out, on success and on failure.
    pub fn build(&mut self, target: &str, invalidate: bool) -> Result<()> {
        let target = JobId::parse(target)?;
        self.advance_stage(ExecutionStage::Runtime)?;

        let result = self.build_inner(&target, invalidate);

        // cache write failures cost future cache hits, never the build
        if let Err(err) = self.artifacts.flush() {
            warn!(%err, "failed to flush the artifact cache index");
        }
        if let Err(err) = self.file_hashes.flush() {
            warn!(%err, "failed to flush the file-hash cache");
        }
        result
    }

    fn build_inner(&self, target: &JobId, invalidate: bool) -> Result<()> {
        let registry = JobRegistry::new();
        for job in self.workspace.all_jobs() {
            registry.register(job)?;
        }

        // synthesize a `build` job for every artifact that does not declare
        // one, wired to the artifact manager
        let mut implied_edges: Vec<(String, String)> = Vec::new();
        for project in self.workspace.projects() {
            for artifact in project.artifacts() {
                if !artifact.has_job("build") {
                    registry.register(Arc::new(self.artifact_build_job(
                        project.id(),
                        artifact.name(),
                        invalidate,
                    )))?;
                }
                let resolution = artifacts::resolve_artifact_dependencies(artifact)?;
                implied_edges.extend(
                    resolution
                        .edges()
                        .iter()
                        .map(|(dependent, prerequisite)| {
                            (dependent.to_string(), prerequisite.to_string())
                        }),
                );
            }
        }

        let mut graph = ExecutionGraph::new();
        for job in registry.jobs() {
            let id = job.id().to_string();
            let mut deps = Vec::new();
            for dependency in job.dependencies() {
                let canonical = JobId::parse(dependency)?.to_string();
                deps.push(registry.get(&canonical).ok_or_else(|| {
                    StrataError::MissingDependency {
                        job: id.clone(),
                        dependency: dependency.clone(),
                    }
                })?);
            }
            for (_, prerequisite) in implied_edges.iter().filter(|(dependent, _)| *dependent == id)
            {
                deps.push(registry.get(prerequisite).ok_or_else(|| {
                    StrataError::MissingDependency {
                        job: id.clone(),
                        dependency: prerequisite.clone(),
                    }
                })?);
            }
            graph.attach(&job, &deps);
        }

        let layers = graph.execution_plan(&target.to_string())?;
        debug!(
            job = %target,
            layers = layers.len(),
            jobs = layers.iter().map(|l| l.len()).sum::<usize>(),
            "computed execution plan"
        );

        let executor = Executor::new(self.events.clone(), self.workers)?;
        executor.execute(&target.to_string(), &layers)
    }

    /// The synthesized `build` job of an artifact: one callable action that
    /// routes through the artifact manager.
    fn artifact_build_job(&self, project_id: &str, artifact: &str, invalidate: bool) -> Job {
        let workspace = self.workspace.clone();
        let extensions = self.extensions.clone();
        let manager = self.artifacts.clone();
        let (project_id_owned, artifact_owned) = (project_id.to_string(), artifact.to_string());

        let mut job = Job::new("build")
            .describe(format!("builds artifact `{artifact}`"))
            .with_action(Action::callable(move |_ctx| {
                let project = workspace
                    .project(&project_id_owned)
                    .ok_or_else(|| StrataError::msg(format!(
                        "project `{project_id_owned}` disappeared from the workspace"
                    )))?;
                let artifact = project.artifact(&artifact_owned).ok_or_else(|| {
                    StrataError::msg(format!(
                        "artifact `{artifact_owned}` disappeared from project `{project_id_owned}`"
                    ))
                })?;
                let blueprint = extensions.blueprint(artifact.blueprint())?;
                let outcome = manager.build_from_dependencies(
                    blueprint.as_ref(),
                    artifact,
                    project,
                    artifact.build_config().as_ref(),
                    invalidate,
                )?;
                match outcome {
                    BuildOutcome::Cached { .. } | BuildOutcome::Built { .. } => Ok(()),
                    BuildOutcome::Failed { cause } => Err(cause),
                }
            }));
        job.set_owner(ComponentId::Project(project_id.to_string()));
        job.set_artifact(artifact);
        job
    }

    /// Removes the orchestrator's data directory: caches and stored
    /// outputs.
    pub fn clean(&self) -> Result<()> {
        let data_dir = self.workspace.data_dir();
        if data_dir.exists() {
            std::fs::remove_dir_all(&data_dir)
                .map_err(|err| StrataError::io(err, &data_dir))?;
            trace!("removed data dir \"{}\"", data_dir.display());
        }
        Ok(())
    }
}

/// Maps a build result to the exit code of the CLI contract.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.exit_code(),
    }
}
