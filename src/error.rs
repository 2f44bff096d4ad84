//! Error types emitted by the orchestrator core.

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
};
use thiserror::Error;

pub type Result<T, E = StrataError> = std::result::Result<T, E>;

/// An I/O error paired with the path that triggered it.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", .path.display())]
pub struct StrataIoError {
    io: io::Error,
    path: PathBuf,
}

impl StrataIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<StrataIoError> for io::Error {
    fn from(err: StrataIoError) -> Self {
        err.io
    }
}

/// Various errors reported by the core.
///
/// Every variant belongs to one of the documented error kinds
/// (`configuration`, `scripting`, `plugin`, `build`, `internal`,
/// `environment`), see [`StrataError::kind()`].
#[derive(Debug, Error)]
pub enum StrataError {
    // configuration
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error("job `{0}` is already registered")]
    DuplicateJob(String),
    #[error("invalid job identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("job `{job}` depends on unknown job `{dependency}`")]
    MissingDependency { job: String, dependency: String },
    #[error("project `{0}` is already defined in this workspace")]
    DuplicateProject(String),
    #[error("unknown plugin component `{0}`")]
    UnknownComponent(String),
    #[error("invalid plugin uri `{0}`")]
    InvalidUri(String),
    #[error("source set root \"{}\" does not exist", .0.display())]
    MissingSourceRoot(PathBuf),
    #[error("invalid source pattern `{pattern}`: {message}")]
    InvalidSourcePattern { pattern: String, message: String },

    // scripting
    #[error("script error: {0}")]
    Script(String),

    // plugin
    #[error("plugin `{uri}` failed to load: {message}")]
    PluginLoad { uri: String, message: String },
    #[error("blueprint failed for artifact `{artifact}`: {source}")]
    Blueprint {
        artifact: String,
        #[source]
        source: Box<StrataError>,
    },
    #[error("blueprint for artifact `{artifact}` reported output \"{}\" which does not exist", .output.display())]
    InvalidBlueprintOutput { artifact: String, output: PathBuf },

    // build
    #[error("build failed")]
    BuildFailed {
        job: Option<String>,
        #[source]
        cause: Box<StrataError>,
    },
    #[error("command `{program}` exited with {status}")]
    CommandFailed { program: String, status: ExitStatus },
    #[error("job `{0}` was cancelled")]
    Cancelled(String),

    // internal
    #[error("dependency cycle detected while scheduling `{0}`")]
    CycleDetected(String),
    #[error("artifact cache index is corrupt: {0}")]
    CacheCorrupt(String),
    #[error("execution stage cannot move backwards from {from} to {to}")]
    StageRegression { from: &'static str, to: &'static str },
    #[error("artifact `{0}` is already being built with the same fingerprint")]
    ConcurrentArtifactBuild(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    // environment
    #[error(transparent)]
    Io(#[from] StrataIoError),

    #[error("{0}")]
    Message(String),
}

impl StrataError {
    pub(crate) fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        StrataIoError::new(err, path).into()
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        StrataError::Message(msg.to_string())
    }

    /// Stable `<category>/<name>` string for this error, e.g.
    /// `configuration/duplicate-job`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownJob(_) => "configuration/unknown-job",
            Self::DuplicateJob(_) => "configuration/duplicate-job",
            Self::InvalidIdentifier(_) => "configuration/invalid-identifier",
            Self::MissingDependency { .. } => "configuration/missing-dependency",
            Self::DuplicateProject(_) => "configuration/duplicate-project",
            Self::UnknownComponent(_) => "configuration/unknown-component",
            Self::InvalidUri(_) => "configuration/invalid-uri",
            Self::MissingSourceRoot(_) => "configuration/missing-source",
            Self::InvalidSourcePattern { .. } => "configuration/invalid-source-pattern",
            Self::Script(_) => "scripting/script-error",
            Self::PluginLoad { .. } => "plugin/load-failed",
            Self::Blueprint { .. } => "plugin/blueprint-failed",
            Self::InvalidBlueprintOutput { .. } => "plugin/invalid-output",
            Self::BuildFailed { .. } => "build/failed",
            Self::CommandFailed { .. } => "build/command-failed",
            Self::Cancelled(_) => "build/cancelled",
            Self::CycleDetected(_) => "internal/cycle-detected",
            Self::CacheCorrupt(_) => "internal/cache-corrupt",
            Self::StageRegression { .. } => "internal/stage-regression",
            Self::ConcurrentArtifactBuild(_) => "internal/concurrent-artifact-build",
            Self::Serde(_) => "internal/serde",
            Self::Io(_) => "environment/io",
            Self::Message(_) => "unknown",
        }
    }

    /// Process exit code mandated for this error by the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self.kind().split('/').next().unwrap_or("unknown") {
            "scripting" => 1,
            "build" => 2,
            "configuration" => 3,
            "internal" => 4,
            "plugin" => 5,
            "environment" => 14,
            _ => 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_exit_codes() {
        assert_eq!(StrataError::DuplicateJob("x".into()).exit_code(), 3);
        assert_eq!(StrataError::Script("boom".into()).exit_code(), 1);
        assert_eq!(
            StrataError::BuildFailed {
                job: Some(":x".into()),
                cause: Box::new(StrataError::msg("inner")),
            }
            .exit_code(),
            2
        );
        assert_eq!(StrataError::CycleDetected(":x".into()).exit_code(), 4);
        assert_eq!(
            StrataError::PluginLoad { uri: "a:b".into(), message: "nope".into() }.exit_code(),
            5
        );
        assert_eq!(
            StrataError::io(io::Error::new(io::ErrorKind::Other, "denied"), "/p").exit_code(),
            14
        );
        assert_eq!(StrataError::msg("?").exit_code(), 15);
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(StrataError::UnknownJob(":x".into()).kind(), "configuration/unknown-job");
        assert_eq!(StrataError::CycleDetected(":x".into()).kind(), "internal/cycle-detected");
        assert_eq!(
            StrataError::MissingSourceRoot(PathBuf::from("/missing")).kind(),
            "configuration/missing-source"
        );
    }
}
