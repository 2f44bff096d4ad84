#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{Result, StrataError, StrataIoError};

pub mod utils;

pub mod hash;

pub mod events;
pub use events::{
    CollectingSink, ContextId, Event, EventBus, EventLevel, EventPayload, EventSink, LogEntry,
    LogSink, TracingSink,
};

pub mod sources;
pub use sources::SourceSet;

pub mod job;
pub use job::{Action, ActionContext, ComponentId, ExternalCallable, Job, JobId};

pub mod workspace;
pub use workspace::{Artifact, ComponentRef, Project, ProjectFilter, Workspace, DATA_DIR_NAME};

pub mod registry;
pub use registry::JobRegistry;

pub mod graph;
pub use graph::{ExecutionGraph, ExecutionLayer, ExecutionNode};

pub mod cache;
pub use cache::{ArtifactCacheEntry, ArtifactCacheIndex, FileHashCache};

pub mod plugins;
pub use plugins::{
    ApiClassUri, ArtifactBlueprint, ArtifactDependency, ArtifactLink, BuildConfig, ComponentUri,
    Dependency, DependencyResolution, EmptyConfig, ExtensionManager, Plugin, PluginRegistrar,
    PluginUri, PluginVersion,
};

pub mod artifacts;
pub use artifacts::{artifact_fingerprint, ArtifactManager, BuildOutcome};

pub mod execute;
pub use execute::Executor;

pub mod engine;
pub use engine::{exit_code, Engine, ExecutionStage};

#[cfg(test)]
use pretty_assertions as _;
#[cfg(test)]
use tracing_subscriber as _;
