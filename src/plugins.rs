//! The contract the core consumes from plugins.
//!
//! Plugins contribute artifact blueprints, dependency kinds and API types,
//! all addressed by URIs of the form `group:name@version`. The core never
//! depends on a concrete plugin; the built-in [`ArtifactDependency`] is the
//! only dependency kind it ships.

use crate::{
    error::{Result, StrataError},
    events::LogSink,
    job::JobId,
    workspace::{Artifact, Project},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

static RE_PLUGIN_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<group>[A-Za-z0-9_-]+):(?P<name>[A-Za-z0-9_-]+)(?:@(?P<version>[0-9]+(?:\.[0-9]+)*))?$",
    )
    .expect("plugin uri regex is valid")
});

static RE_COMPONENT_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<group>[A-Za-z0-9_-]+):(?P<name>[A-Za-z0-9_-]+)(?:@(?P<version>[0-9]+(?:\.[0-9]+)*))?:(?P<component>[A-Za-z0-9_-]+)$",
    )
    .expect("component uri regex is valid")
});

static RE_API_CLASS_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<group>[A-Za-z0-9_-]+):(?P<name>[A-Za-z0-9_-]+)(?:@(?P<version>[0-9]+(?:\.[0-9]+)*))?/(?P<class>[A-Za-z0-9_-]+)$",
    )
    .expect("api class uri regex is valid")
});

/// A dotted-numeric plugin version, e.g. `1`, `0.4` or `2.12.0`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PluginVersion(Vec<u64>);

impl PluginVersion {
    /// The version assumed for plugins registered without one.
    pub fn zero() -> Self {
        Self(vec![0])
    }

    pub fn parse(input: &str) -> Result<Self> {
        let parts: Option<Vec<u64>> =
            input.split('.').map(|part| part.parse::<u64>().ok()).collect();
        match parts {
            Some(parts) if !parts.is_empty() => Ok(Self(parts)),
            _ => Err(StrataError::InvalidUri(input.to_string())),
        }
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = self.0.iter();
        if let Some(first) = parts.next() {
            write!(f, "{first}")?;
        }
        for part in parts {
            write!(f, ".{part}")?;
        }
        Ok(())
    }
}

/// Identifies a plugin: `group:name@version`, version optional.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PluginUri {
    pub group: String,
    pub name: String,
    pub version: Option<PluginVersion>,
}

impl PluginUri {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), name: name.into(), version: None }
    }

    #[must_use]
    pub fn with_version(mut self, version: PluginVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn parse(input: &str) -> Result<Self> {
        let captures = RE_PLUGIN_URI
            .captures(input)
            .ok_or_else(|| StrataError::InvalidUri(input.to_string()))?;
        Ok(Self {
            group: captures["group"].to_string(),
            name: captures["name"].to_string(),
            version: captures.name("version").map(|m| PluginVersion::parse(m.as_str())).transpose()?,
        })
    }
}

impl fmt::Display for PluginUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}

/// Identifies a capability within a plugin: `group:name@version:component`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ComponentUri {
    pub plugin: PluginUri,
    pub component: String,
}

impl ComponentUri {
    pub fn new(plugin: PluginUri, component: impl Into<String>) -> Self {
        Self { plugin, component: component.into() }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let captures = RE_COMPONENT_URI
            .captures(input)
            .ok_or_else(|| StrataError::InvalidUri(input.to_string()))?;
        Ok(Self {
            plugin: PluginUri {
                group: captures["group"].to_string(),
                name: captures["name"].to_string(),
                version: captures
                    .name("version")
                    .map(|m| PluginVersion::parse(m.as_str()))
                    .transpose()?,
            },
            component: captures["component"].to_string(),
        })
    }
}

impl fmt::Display for ComponentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.plugin, self.component)
    }
}

/// Identifies a plugin-exposed API type: `group:name@version/Class`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ApiClassUri {
    pub plugin: PluginUri,
    pub class: String,
}

impl ApiClassUri {
    pub fn parse(input: &str) -> Result<Self> {
        let captures = RE_API_CLASS_URI
            .captures(input)
            .ok_or_else(|| StrataError::InvalidUri(input.to_string()))?;
        Ok(Self {
            plugin: PluginUri {
                group: captures["group"].to_string(),
                name: captures["name"].to_string(),
                version: captures
                    .name("version")
                    .map(|m| PluginVersion::parse(m.as_str()))
                    .transpose()?,
            },
            class: captures["class"].to_string(),
        })
    }
}

impl fmt::Display for ApiClassUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin, self.class)
    }
}

/// A build-configuration record populated by user scripts for a blueprint.
///
/// Implementations expose the fields that contribute to the artifact
/// fingerprint as `(name, stringified value)` pairs; the core sorts and
/// hashes them.
pub trait BuildConfig: fmt::Debug + Send + Sync {
    /// Name of the configuration record type this blueprint expects.
    fn config_type(&self) -> &str;

    fn fingerprint_fields(&self) -> Vec<(String, String)>;
}

/// A configuration record with no fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyConfig;

impl BuildConfig for EmptyConfig {
    fn config_type(&self) -> &str {
        "empty"
    }

    fn fingerprint_fields(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Builds the outputs of an artifact.
///
/// `run` must be deterministic for identical sources and configuration; its
/// returned paths are moved into the content-addressed cache on success.
pub trait ArtifactBlueprint: Send + Sync {
    /// Name of the configuration record type user scripts populate for this
    /// blueprint.
    fn config_type(&self) -> &str;

    fn run(
        &self,
        artifact: &Artifact,
        project: &Project,
        config: &dyn BuildConfig,
        log: &LogSink,
    ) -> Result<Vec<std::path::PathBuf>>;
}

/// An inter-artifact link recorded during dependency resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactLink {
    pub from_project: String,
    pub from_artifact: String,
    pub to_project: String,
    pub to_artifact: String,
}

/// Collects the effects of resolving an artifact's dependencies: implied
/// job-dependency edges and inter-artifact links.
#[derive(Debug)]
pub struct DependencyResolution {
    project: String,
    artifact: String,
    edges: Vec<(JobId, JobId)>,
    links: Vec<ArtifactLink>,
}

impl DependencyResolution {
    pub fn new(project: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            artifact: artifact.into(),
            edges: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Identifier of the project owning the artifact being resolved.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Name of the artifact being resolved.
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// Declares that `dependent` must run after `prerequisite`.
    pub fn add_job_dependency(&mut self, dependent: JobId, prerequisite: JobId) {
        self.edges.push((dependent, prerequisite));
    }

    /// Records a link from the artifact being resolved to another artifact.
    pub fn link_to(&mut self, project: impl Into<String>, artifact: impl Into<String>) {
        self.links.push(ArtifactLink {
            from_project: self.project.clone(),
            from_artifact: self.artifact.clone(),
            to_project: project.into(),
            to_artifact: artifact.into(),
        });
    }

    pub fn edges(&self) -> &[(JobId, JobId)] {
        &self.edges
    }

    pub fn links(&self) -> &[ArtifactLink] {
        &self.links
    }

    pub fn into_parts(self) -> (Vec<(JobId, JobId)>, Vec<ArtifactLink>) {
        (self.edges, self.links)
    }
}

/// A polymorphic dependency contributed by a plugin.
pub trait Dependency: fmt::Debug + Send + Sync {
    /// The registered kind word of this dependency.
    fn kind(&self) -> &str;

    /// Attaches implied job dependencies and records inter-artifact links.
    fn resolve(&self, resolution: &mut DependencyResolution) -> Result<()>;
}

/// Parses loader-supplied arguments into a dependency instance.
pub type DependencyParser = fn(&[String]) -> Result<Box<dyn Dependency>>;

/// The built-in dependency kind: depend on another artifact of the
/// workspace.
///
/// Resolution adds the other artifact's `build` job as a predecessor of the
/// current artifact's `build` job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactDependency {
    pub project: String,
    pub artifact: String,
}

impl ArtifactDependency {
    pub const KIND: &'static str = "artifact";

    pub fn new(project: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self { project: project.into(), artifact: artifact.into() }
    }

    /// Parser registered for the `artifact` dependency kind; expects
    /// `[project, artifact]` arguments.
    pub fn parse(args: &[String]) -> Result<Box<dyn Dependency>> {
        match args {
            [project, artifact] => Ok(Box::new(Self::new(project, artifact))),
            _ => Err(StrataError::msg(format!(
                "artifact dependency expects `[project, artifact]` arguments, got {}",
                args.len()
            ))),
        }
    }
}

impl Dependency for ArtifactDependency {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn resolve(&self, resolution: &mut DependencyResolution) -> Result<()> {
        let dependent =
            JobId::artifact(resolution.project(), resolution.artifact(), "build");
        let prerequisite = JobId::artifact(&self.project, &self.artifact, "build");
        resolution.add_job_dependency(dependent, prerequisite);
        resolution.link_to(&self.project, &self.artifact);
        Ok(())
    }
}

/// A plugin registers its capabilities through this handle.
pub struct PluginRegistrar<'a> {
    manager: &'a mut ExtensionManager,
    plugin: PluginUri,
}

impl PluginRegistrar<'_> {
    /// Registers an artifact blueprint under `component` of the plugin URI.
    pub fn blueprint(&mut self, component: &str, blueprint: Arc<dyn ArtifactBlueprint>) {
        let version = self.plugin.version.clone().unwrap_or_else(PluginVersion::zero);
        self.manager
            .blueprints
            .entry(component_key(&self.plugin, component))
            .or_default()
            .insert(version, blueprint);
    }

    /// Registers a dependency kind with its argument parser.
    pub fn dependency_kind(&mut self, kind: &str, parser: DependencyParser) {
        self.manager.dependency_kinds.insert(kind.to_string(), parser);
    }

    /// Registers an exposed API type.
    pub fn api_class(&mut self, class: &str) {
        self.manager
            .api_classes
            .insert(ApiClassUri { plugin: self.plugin.clone(), class: class.to_string() });
    }
}

/// A provider of blueprints, components, dependency kinds and API types.
pub trait Plugin: Send + Sync {
    fn uri(&self) -> PluginUri;

    fn register(&self, registrar: &mut PluginRegistrar<'_>) -> Result<()>;
}

fn component_key(plugin: &PluginUri, component: &str) -> String {
    format!("{}:{}:{}", plugin.group, plugin.name, component)
}

/// Looks plugin capabilities up by URI.
///
/// When a component URI omits the version, the highest registered version of
/// that component wins.
pub struct ExtensionManager {
    blueprints: HashMap<String, BTreeMap<PluginVersion, Arc<dyn ArtifactBlueprint>>>,
    dependency_kinds: HashMap<String, DependencyParser>,
    api_classes: HashSet<ApiClassUri>,
}

impl Default for ExtensionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionManager {
    /// An extension manager with the built-in `artifact` dependency kind
    /// pre-registered.
    pub fn new() -> Self {
        let mut dependency_kinds: HashMap<String, DependencyParser> = HashMap::new();
        dependency_kinds.insert(ArtifactDependency::KIND.to_string(), ArtifactDependency::parse);
        Self { blueprints: HashMap::new(), dependency_kinds, api_classes: HashSet::new() }
    }

    /// Loads a plugin by letting it register its capabilities.
    pub fn load(&mut self, plugin: &dyn Plugin) -> Result<()> {
        let uri = plugin.uri();
        debug!(plugin = %uri, "loading plugin");
        let mut registrar = PluginRegistrar { manager: self, plugin: uri.clone() };
        plugin.register(&mut registrar).map_err(|err| StrataError::PluginLoad {
            uri: uri.to_string(),
            message: err.to_string(),
        })
    }

    /// Resolves a blueprint component URI.
    pub fn blueprint(&self, uri: &ComponentUri) -> Result<Arc<dyn ArtifactBlueprint>> {
        let versions = self
            .blueprints
            .get(&component_key(&uri.plugin, &uri.component))
            .ok_or_else(|| StrataError::UnknownComponent(uri.to_string()))?;
        let blueprint = match &uri.plugin.version {
            Some(version) => versions.get(version),
            None => versions.values().next_back(),
        };
        blueprint.cloned().ok_or_else(|| StrataError::UnknownComponent(uri.to_string()))
    }

    /// Returns the parser registered for a dependency kind.
    pub fn dependency_parser(&self, kind: &str) -> Result<DependencyParser> {
        self.dependency_kinds
            .get(kind)
            .copied()
            .ok_or_else(|| StrataError::UnknownComponent(format!("dependency kind `{kind}`")))
    }

    /// Parses loader-supplied arguments into a dependency of the given kind.
    pub fn parse_dependency(&self, kind: &str, args: &[String]) -> Result<Box<dyn Dependency>> {
        (self.dependency_parser(kind)?)(args)
    }

    pub fn has_api_class(&self, uri: &ApiClassUri) -> bool {
        self.api_classes.contains(uri)
    }
}

impl fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("blueprints", &self.blueprints.keys())
            .field("dependency_kinds", &self.dependency_kinds.keys())
            .field("api_classes", &self.api_classes)
            .finish()
    }
}
