//! The workspace data model: projects, artifacts, source sets and filters.
//!
//! A configuration loader populates one [`Workspace`] per invocation; once
//! the engine enters the runtime stage the workspace is treated as
//! immutable.

use crate::{
    error::{Result, StrataError},
    events::LogEntry,
    job::{ComponentId, Job, JobId},
    plugins::{BuildConfig, ComponentUri, Dependency, EmptyConfig},
    sources::SourceSet,
    utils,
};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Name of the orchestrator's data directory inside a workspace root.
pub const DATA_DIR_NAME: &str = ".strata";

/// Predicate over project identifiers.
#[derive(Clone, Debug)]
pub enum ProjectFilter {
    All,
    Exact(String),
    Regex(regex::Regex),
    AnyOf(Vec<ProjectFilter>),
}

impl ProjectFilter {
    pub fn matches(&self, project_id: &str) -> bool {
        match self {
            ProjectFilter::All => true,
            ProjectFilter::Exact(name) => name == project_id,
            ProjectFilter::Regex(regex) => regex.is_match(project_id),
            ProjectFilter::AnyOf(filters) => filters.iter().any(|f| f.matches(project_id)),
        }
    }
}

/// A filter predicate paired with a callback applied to matching projects.
pub struct ProjectFilterHook {
    filter: ProjectFilter,
    callback: Box<dyn Fn(&mut Project) + Send + Sync>,
}

impl fmt::Debug for ProjectFilterHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectFilterHook").field("filter", &self.filter).finish_non_exhaustive()
    }
}

/// The root of one build invocation.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    projects: BTreeMap<String, Project>,
    jobs: Vec<Arc<Job>>,
    filter_hooks: Vec<ProjectFilterHook>,
}

impl Workspace {
    /// Creates a workspace rooted at an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = utils::canonicalize(root.as_ref())?;
        Ok(Self {
            root,
            projects: BTreeMap::new(),
            jobs: Vec::new(),
            filter_hooks: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The orchestrator's data directory, `<root>/.strata`.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }

    /// Location of the file-hash cache store.
    pub fn file_hash_cache_path(&self) -> PathBuf {
        self.cache_dir().join("filehashes")
    }

    /// Location of the artifact cache index.
    pub fn artifact_index_path(&self) -> PathBuf {
        self.cache_dir().join("artifacts.json")
    }

    /// Directory holding content-addressed cached outputs.
    pub fn artifact_store_dir(&self) -> PathBuf {
        self.data_dir().join("artifacts")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir().join("plugins")
    }

    /// Adds a workspace-owned job.
    pub fn add_job(&mut self, mut job: Job) {
        job.set_owner(ComponentId::Workspace);
        self.jobs.push(Arc::new(job));
    }

    /// Jobs owned directly by the workspace.
    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    /// Inserts a project, enforcing identifier uniqueness.
    pub fn add_project(&mut self, project: Project) -> Result<()> {
        if self.projects.contains_key(project.id()) {
            return Err(StrataError::DuplicateProject(project.id().to_string()));
        }
        self.projects.insert(project.id().to_string(), project);
        Ok(())
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn project_mut(&mut self, id: &str) -> Option<&mut Project> {
        self.projects.get_mut(id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    /// Registers a filter hook; hooks run in registration order when
    /// [`Workspace::apply_filter_hooks`] is called.
    pub fn add_filter_hook(
        &mut self,
        filter: ProjectFilter,
        callback: impl Fn(&mut Project) + Send + Sync + 'static,
    ) {
        self.filter_hooks.push(ProjectFilterHook { filter, callback: Box::new(callback) });
    }

    /// Applies every registered hook to the projects matching its filter.
    pub fn apply_filter_hooks(&mut self) {
        let hooks = std::mem::take(&mut self.filter_hooks);
        for hook in &hooks {
            for project in self.projects.values_mut() {
                if hook.filter.matches(&project.id) {
                    (hook.callback)(project);
                }
            }
        }
        self.filter_hooks = hooks;
    }

    /// Resolves a component reference.
    pub fn component(&self, id: &ComponentId) -> Option<ComponentRef<'_>> {
        match id {
            ComponentId::Workspace => Some(ComponentRef::Workspace(self)),
            ComponentId::Project(project) => self.project(project).map(ComponentRef::Project),
        }
    }

    /// Every job of the workspace, its projects and their artifacts, in
    /// deterministic order.
    pub fn all_jobs(&self) -> Vec<Arc<Job>> {
        let mut jobs = self.jobs.clone();
        for project in self.projects.values() {
            jobs.extend(project.jobs().iter().cloned());
            for artifact in project.artifacts() {
                jobs.extend(artifact.jobs().iter().cloned());
            }
        }
        jobs
    }
}

/// A view of a job's owning component.
#[derive(Clone, Copy, Debug)]
pub enum ComponentRef<'a> {
    Workspace(&'a Workspace),
    Project(&'a Project),
}

impl ComponentRef<'_> {
    /// The component identifier; `None` for the workspace.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            ComponentRef::Workspace(_) => None,
            ComponentRef::Project(project) => Some(project.id()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ComponentRef::Workspace(workspace) => workspace.root(),
            ComponentRef::Project(project) => project.root(),
        }
    }

    pub fn owned_jobs(&self) -> &[Arc<Job>] {
        match self {
            ComponentRef::Workspace(workspace) => workspace.jobs(),
            ComponentRef::Project(project) => project.jobs(),
        }
    }
}

/// A buildable unit rooted at a subdirectory of the workspace.
#[derive(Debug)]
pub struct Project {
    name: String,
    id: String,
    root: PathBuf,
    version: Option<String>,
    description: Option<String>,
    group: Option<String>,
    artifacts: BTreeMap<String, Artifact>,
    source_sets: BTreeMap<String, SourceSet>,
    jobs: Vec<Arc<Job>>,
}

impl Project {
    /// Creates a project rooted at `root`, which must live below the
    /// workspace root. The identifier is the relative path with directory
    /// separators replaced by `:`; the name is its last segment, lowercased.
    pub fn new(workspace_root: &Path, root: impl Into<PathBuf>) -> Result<Self> {
        let root = utils::canonicalized(root.into());
        let rel = root.strip_prefix(workspace_root).map_err(|_| {
            StrataError::msg(format!(
                "project root \"{}\" is not inside the workspace \"{}\"",
                root.display(),
                workspace_root.display()
            ))
        })?;

        let mut segments = Vec::new();
        for component in rel.components() {
            let segment = component.as_os_str().to_string_lossy();
            if segment.is_empty()
                || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(StrataError::InvalidIdentifier(utils::slash_str(rel)));
            }
            segments.push(segment.into_owned());
        }
        let name = segments
            .last()
            .ok_or_else(|| StrataError::InvalidIdentifier(utils::slash_str(rel)))?
            .to_lowercase();

        Ok(Self {
            name,
            id: segments.join(":"),
            root,
            version: None,
            description: None,
            group: None,
            artifacts: BTreeMap::new(),
            source_sets: BTreeMap::new(),
            jobs: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = Some(version.into());
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn set_group(&mut self, group: impl Into<String>) {
        self.group = Some(group.into());
    }

    /// Adds a project-owned job.
    pub fn add_job(&mut self, mut job: Job) {
        job.set_owner(ComponentId::Project(self.id.clone()));
        self.jobs.push(Arc::new(job));
    }

    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    pub fn add_source_set(&mut self, source_set: SourceSet) {
        self.source_sets.insert(source_set.name().to_string(), source_set);
    }

    pub fn source_set(&self, name: &str) -> Option<&SourceSet> {
        self.source_sets.get(name)
    }

    /// Source sets in name order; the order the fingerprint combines them
    /// in.
    pub fn source_sets(&self) -> impl Iterator<Item = &SourceSet> {
        self.source_sets.values()
    }

    /// Adds an artifact, rebinding its jobs to this project.
    pub fn add_artifact(&mut self, mut artifact: Artifact) -> Result<()> {
        if self.artifacts.contains_key(artifact.name()) {
            return Err(StrataError::msg(format!(
                "artifact `{}` is already defined in project `{}`",
                artifact.name(),
                self.id
            )));
        }
        artifact.project = self.id.clone();
        for job in &mut artifact.jobs {
            if let Some(job) = Arc::get_mut(job) {
                job.set_owner(ComponentId::Project(self.id.clone()));
            }
        }
        self.artifacts.insert(artifact.name().to_string(), artifact);
        Ok(())
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }
}

/// A plugin-blueprinted group of jobs producing build outputs, keyed by
/// fingerprint in the artifact cache.
#[derive(Debug)]
pub struct Artifact {
    name: String,
    description: String,
    project: String,
    jobs: Vec<Arc<Job>>,
    dependencies: Vec<Box<dyn Dependency>>,
    blueprint: ComponentUri,
    build_config: Arc<dyn BuildConfig>,
    log_cache: Mutex<Option<Vec<LogEntry>>>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, blueprint: ComponentUri) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            project: String::new(),
            jobs: Vec::new(),
            dependencies: Vec::new(),
            blueprint,
            build_config: Arc::new(EmptyConfig),
            log_cache: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Arc<dyn BuildConfig>) -> Self {
        self.build_config = config;
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: Box<dyn Dependency>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Adds an artifact-owned job; ownership is finalized when the artifact
    /// is added to a project.
    #[must_use]
    pub fn with_job(mut self, mut job: Job) -> Self {
        job.set_artifact(self.name.clone());
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Identifier of the owning project.
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    pub fn dependencies(&self) -> &[Box<dyn Dependency>] {
        &self.dependencies
    }

    pub fn blueprint(&self) -> &ComponentUri {
        &self.blueprint
    }

    pub fn build_config(&self) -> &Arc<dyn BuildConfig> {
        &self.build_config
    }

    /// Canonical id of this artifact's `build` job.
    pub fn build_job_id(&self) -> JobId {
        JobId::artifact(&self.project, &self.name, "build")
    }

    /// Whether a job with the given name was explicitly declared for this
    /// artifact.
    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.iter().any(|job| job.name() == name)
    }

    /// The log cache slot, filled after a build or cache replay.
    pub fn log_cache(&self) -> Option<Vec<LogEntry>> {
        self.log_cache.lock().expect("log cache lock poisoned").clone()
    }

    pub fn set_log_cache(&self, entries: Vec<LogEntry>) {
        *self.log_cache.lock().expect("log cache lock poisoned") = Some(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn workspace_with_project(segments: &[&str]) -> (tempfile::TempDir, Workspace, String) {
        let dir = tempfile::tempdir().unwrap();
        let mut path = dir.path().to_path_buf();
        for segment in segments {
            path.push(segment);
        }
        fs::create_dir_all(&path).unwrap();
        let mut workspace = Workspace::new(dir.path()).unwrap();
        let project = Project::new(workspace.root(), &path).unwrap();
        let id = project.id().to_string();
        workspace.add_project(project).unwrap();
        (dir, workspace, id)
    }

    #[test]
    fn project_identifier_derives_from_path() {
        let (_dir, workspace, id) = workspace_with_project(&["apps", "Backend"]);
        assert_eq!(id, "apps:Backend");
        let project = workspace.project(&id).unwrap();
        assert_eq!(project.name(), "backend");
    }

    #[test]
    fn duplicate_project_identifiers_are_fatal() {
        let (_dir, mut workspace, id) = workspace_with_project(&["app"]);
        let duplicate = Project::new(&workspace.root().to_path_buf(), workspace.root().join("app"))
            .unwrap();
        let err = workspace.add_project(duplicate).unwrap_err();
        assert_eq!(err.kind(), "configuration/duplicate-project");
        assert!(workspace.project(&id).is_some());
    }

    #[test]
    fn project_roots_outside_the_workspace_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        assert!(Project::new(workspace.root(), other.path()).is_err());
    }

    #[test]
    fn filters_match_as_documented() {
        assert!(ProjectFilter::All.matches("anything"));
        assert!(ProjectFilter::Exact("app".into()).matches("app"));
        assert!(!ProjectFilter::Exact("app".into()).matches("app:sub"));
        assert!(ProjectFilter::Regex(regex::Regex::new("^apps:").unwrap()).matches("apps:web"));
        assert!(ProjectFilter::AnyOf(vec![
            ProjectFilter::Exact("a".into()),
            ProjectFilter::Exact("b".into()),
        ])
        .matches("b"));
    }

    #[test]
    fn filter_hooks_run_in_order_on_matching_projects() {
        let (_dir, mut workspace, id) = workspace_with_project(&["app"]);
        workspace.add_filter_hook(ProjectFilter::All, |project| {
            project.set_description("first");
        });
        workspace.add_filter_hook(ProjectFilter::Exact("app".into()), |project| {
            project.set_description(format!("{}+second", project.description().unwrap()));
        });
        workspace.add_filter_hook(ProjectFilter::Exact("other".into()), |project| {
            project.set_description("never");
        });
        workspace.apply_filter_hooks();
        assert_eq!(workspace.project(&id).unwrap().description(), Some("first+second"));
    }

    #[test]
    fn ownership_is_rebound_when_attaching() {
        let (_dir, mut workspace, id) = workspace_with_project(&["app"]);
        workspace.add_job(Job::new("clean"));
        assert_eq!(workspace.jobs()[0].id().to_string(), ":clean");

        let project = workspace.project_mut(&id).unwrap();
        project.add_job(Job::new("compile"));
        assert_eq!(project.jobs()[0].id().to_string(), "app:compile");

        let artifact = Artifact::new("dist", ComponentUri::parse("tools:zip:package").unwrap())
            .with_job(Job::new("stage"));
        project.add_artifact(artifact).unwrap();
        let artifact = project.artifact("dist").unwrap();
        assert_eq!(artifact.jobs()[0].id().to_string(), "app/dist:stage");
        assert_eq!(artifact.build_job_id().to_string(), "app/dist:build");
    }

    #[test]
    fn all_jobs_is_flat_and_deterministic() {
        let (_dir, mut workspace, id) = workspace_with_project(&["app"]);
        workspace.add_job(Job::new("clean"));
        workspace.project_mut(&id).unwrap().add_job(Job::new("compile"));

        let ids: Vec<String> =
            workspace.all_jobs().iter().map(|job| job.id().to_string()).collect();
        assert_eq!(ids, vec![":clean", "app:compile"]);
    }
}
