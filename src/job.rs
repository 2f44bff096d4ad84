//! Jobs, their canonical identifiers and executable actions.

use crate::{
    error::{Result, StrataError},
    events::{EventBus, EventLevel, EventPayload},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

/// Matches the canonical job identifier grammar:
/// `[<component-id>][/<artifact-name>]:<job-name>`, where the component id
/// itself may contain `:`-separated segments and the leading part is omitted
/// entirely for a bare job name.
static RE_JOB_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?:(?P<component>[A-Za-z0-9_]+(?::[A-Za-z0-9_]+)*)(?:/(?P<artifact>[A-Za-z0-9_]+))?)?:)?(?P<job>[A-Za-z0-9_]+)$",
    )
    .expect("job id regex is valid")
});

/// The owner of a job.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ComponentId {
    Workspace,
    Project(String),
}

impl ComponentId {
    /// The project identifier, `None` for the workspace.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            ComponentId::Workspace => None,
            ComponentId::Project(id) => Some(id),
        }
    }
}

/// Canonical identifier of a job.
///
/// The canonical rendering always contains the `:` separator, so a
/// workspace-owned job `clean` formats as `:clean`. Parsing additionally
/// accepts the bare `clean` spelling.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct JobId {
    component: Option<String>,
    artifact: Option<String>,
    name: String,
}

impl JobId {
    /// A workspace-owned job.
    pub fn workspace(name: impl Into<String>) -> Self {
        Self { component: None, artifact: None, name: name.into() }
    }

    /// A job owned directly by a project.
    pub fn project(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self { component: Some(component.into()), artifact: None, name: name.into() }
    }

    /// A job owned by an artifact within a project.
    pub fn artifact(
        component: impl Into<String>,
        artifact: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            component: Some(component.into()),
            artifact: Some(artifact.into()),
            name: name.into(),
        }
    }

    /// Parses an identifier, failing with `configuration/invalid-identifier`
    /// when it does not match the grammar.
    pub fn parse(input: &str) -> Result<Self> {
        let captures = RE_JOB_ID
            .captures(input)
            .ok_or_else(|| StrataError::InvalidIdentifier(input.to_string()))?;
        Ok(Self {
            component: captures.name("component").map(|m| m.as_str().to_string()),
            artifact: captures.name("artifact").map(|m| m.as_str().to_string()),
            name: captures["job"].to_string(),
        })
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn artifact_name(&self) -> Option<&str> {
        self.artifact.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(component) = &self.component {
            f.write_str(component)?;
            if let Some(artifact) = &self.artifact {
                write!(f, "/{artifact}")?;
            }
        }
        write!(f, ":{}", self.name)
    }
}

/// An opaque callable contributed by the configuration loader.
///
/// The closure is the loader's handle into its own scripting world; the
/// returned `Result` is the action's completion signal.
#[derive(Clone)]
pub struct ExternalCallable {
    handle: Arc<dyn Fn(&ActionContext<'_>) -> Result<()> + Send + Sync>,
}

impl ExternalCallable {
    pub fn new(handle: impl Fn(&ActionContext<'_>) -> Result<()> + Send + Sync + 'static) -> Self {
        Self { handle: Arc::new(handle) }
    }

    pub(crate) fn call(&self, ctx: &ActionContext<'_>) -> Result<()> {
        (self.handle)(ctx)
    }
}

impl fmt::Debug for ExternalCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalCallable").finish_non_exhaustive()
    }
}

/// One executable step of a job.
#[derive(Clone, Debug)]
pub enum Action {
    /// Spawn a program and forward its output to the event stream.
    Shell(ShellAction),
    /// Emit a message into the event stream.
    Log(LogAction),
    /// Invoke a callable owned by the configuration loader.
    Callable(ExternalCallable),
}

impl Action {
    pub fn shell(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Action::Shell(ShellAction {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
        })
    }

    pub fn log(message: impl Into<String>) -> Self {
        Action::Log(LogAction { message: message.into() })
    }

    pub fn callable(
        handle: impl Fn(&ActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Action::Callable(ExternalCallable::new(handle))
    }
}

#[derive(Clone, Debug)]
pub struct ShellAction {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LogAction {
    pub message: String,
}

/// Runtime services available to an action while it executes.
pub struct ActionContext<'a> {
    events: &'a Arc<EventBus>,
    cancel: &'a AtomicBool,
    job_id: &'a JobId,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        events: &'a Arc<EventBus>,
        cancel: &'a AtomicBool,
        job_id: &'a JobId,
    ) -> Self {
        Self { events, cancel, job_id }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.events
    }

    pub fn job_id(&self) -> &JobId {
        self.job_id
    }

    /// Whether the build has been cancelled. Long-running actions are
    /// expected to check this between sub-steps and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Emits a `script-log` event from within the action.
    pub fn log(&self, level: EventLevel, message: impl Into<String>) {
        self.events.emit(level, EventPayload::ScriptLog { message: message.into() });
    }
}

impl fmt::Debug for ActionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext").field("job_id", &self.job_id).finish_non_exhaustive()
    }
}

/// An executable step registered under a canonical identifier.
///
/// A job is exclusively owned by its component (the workspace or one
/// project), optionally on behalf of an artifact. Dependencies are recorded
/// as identifier strings and resolved against the registry when the
/// execution graph is assembled.
#[derive(Clone, Debug)]
pub struct Job {
    name: String,
    owner: ComponentId,
    artifact: Option<String>,
    description: String,
    dependencies: Vec<String>,
    actions: Vec<Action>,
    blocking: bool,
}

impl Job {
    /// Creates a workspace-owned job; ownership is rebound when the job is
    /// added to a project or artifact.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: ComponentId::Workspace,
            artifact: None,
            description: String::new(),
            dependencies: Vec::new(),
            actions: Vec::new(),
            blocking: true,
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Marks this job as a background job: started in its layer but awaited
    /// only at the end of the build.
    #[must_use]
    pub fn background(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &ComponentId {
        &self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: ComponentId) {
        self.owner = owner;
    }

    pub fn artifact(&self) -> Option<&str> {
        self.artifact.as_deref()
    }

    pub(crate) fn set_artifact(&mut self, artifact: impl Into<String>) {
        self.artifact = Some(artifact.into());
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// The canonical identifier of this job.
    pub fn id(&self) -> JobId {
        match (&self.owner, &self.artifact) {
            (ComponentId::Workspace, _) => JobId::workspace(&self.name),
            (ComponentId::Project(project), None) => JobId::project(project, &self.name),
            (ComponentId::Project(project), Some(artifact)) => {
                JobId::artifact(project, artifact, &self.name)
            }
        }
    }
}
