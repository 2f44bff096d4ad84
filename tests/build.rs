//! End-to-end build scenarios against temporary workspaces.

use pretty_assertions::assert_eq;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
};
use strata_build::{
    exit_code, Action, Artifact, ArtifactBlueprint, ArtifactCacheIndex, BuildConfig,
    CollectingSink, ComponentUri, Engine, EventBus, ExtensionManager, Job, LogSink, Plugin,
    PluginRegistrar, PluginUri, PluginVersion, Project, Result, SourceSet, Workspace,
};

/// A blueprint that hashes the project's `sources` set into `out.bin` and
/// counts its invocations.
#[derive(Debug)]
struct HashingBlueprint {
    runs: Arc<AtomicUsize>,
}

impl ArtifactBlueprint for HashingBlueprint {
    fn config_type(&self) -> &str {
        "empty"
    }

    fn run(
        &self,
        _artifact: &Artifact,
        project: &Project,
        _config: &dyn BuildConfig,
        log: &LogSink,
    ) -> Result<Vec<PathBuf>> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let sources = project.source_set("sources").expect("project declares `sources`");
        let rel = &sources.resolve()?[0];
        let content = fs::read_to_string(sources.root().join(rel)).unwrap();
        log.info(format!("packing {content}"));

        let work_dir = project.root().join("target");
        fs::create_dir_all(&work_dir).unwrap();
        let out = work_dir.join("out.bin");
        fs::write(&out, strata_build::hash::hash_content(&content)).unwrap();
        Ok(vec![out])
    }
}

struct PackPlugin {
    runs: Arc<AtomicUsize>,
}

impl Plugin for PackPlugin {
    fn uri(&self) -> PluginUri {
        PluginUri::new("tools", "pack").with_version(PluginVersion::parse("1").unwrap())
    }

    fn register(&self, registrar: &mut PluginRegistrar<'_>) -> Result<()> {
        registrar.blueprint("binary", Arc::new(HashingBlueprint { runs: self.runs.clone() }));
        Ok(())
    }
}

fn project_dir(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn engine_with_sink(workspace: Workspace, extensions: ExtensionManager) -> (Engine, Arc<CollectingSink>) {
    let events = Arc::new(EventBus::new());
    let sink = Arc::new(CollectingSink::new());
    events.add_sink(Box::new(sink.clone()));
    (Engine::new(workspace, extensions, events).unwrap(), sink)
}

fn event_values(sink: &CollectingSink) -> Vec<serde_json::Value> {
    sink.events().iter().map(|event| serde_json::to_value(event).unwrap()).collect()
}

fn layer_jobs(sink: &CollectingSink) -> Vec<Vec<String>> {
    event_values(sink)
        .iter()
        .filter(|event| event["kind"] == "build-layer-started")
        .map(|event| {
            event["jobs"]
                .as_array()
                .unwrap()
                .iter()
                .map(|j| j.as_str().unwrap().to_string())
                .collect()
        })
        .collect()
}

#[test]
fn linear_chain_builds_in_three_layers() {
    let dir = tempfile::tempdir().unwrap();
    let mut workspace = Workspace::new(dir.path()).unwrap();
    workspace.add_job(Job::new("clean").with_action(Action::log("cleaning")));

    let app_root = project_dir(dir.path(), "app");
    let mut app = Project::new(workspace.root(), app_root).unwrap();
    app.add_job(Job::new("build").depends_on(":clean").with_action(Action::log("building")));
    app.add_job(Job::new("run").depends_on("app:build").with_action(Action::log("running")));
    workspace.add_project(app).unwrap();

    let (mut engine, sink) = engine_with_sink(workspace, ExtensionManager::new());
    let result = engine.build("app:run", false);
    assert_eq!(exit_code(&result), 0);

    assert_eq!(
        layer_jobs(&sink),
        vec![
            vec![":clean".to_string()],
            vec!["app:build".to_string()],
            vec!["app:run".to_string()],
        ]
    );
}

#[test]
fn independent_jobs_run_concurrently_in_one_layer() {
    let dir = tempfile::tempdir().unwrap();
    let mut workspace = Workspace::new(dir.path()).unwrap();

    let app_root = project_dir(dir.path(), "app");
    let mut app = Project::new(workspace.root(), app_root).unwrap();

    // both jobs must be in flight at once for the barrier to release
    let barrier = Arc::new(Barrier::new(2));
    let (left, right) = (barrier.clone(), barrier.clone());
    app.add_job(Job::new("a").with_action(Action::callable(move |_| {
        left.wait();
        Ok(())
    })));
    app.add_job(Job::new("b").with_action(Action::callable(move |_| {
        right.wait();
        Ok(())
    })));
    app.add_job(Job::new("c").depends_on("app:a").depends_on("app:b"));
    workspace.add_project(app).unwrap();

    let (mut engine, sink) = engine_with_sink(workspace, ExtensionManager::new());
    engine.set_workers(2);
    let result = engine.build("app:c", false);
    assert_eq!(exit_code(&result), 0);

    let layers = layer_jobs(&sink);
    assert_eq!(layers.len(), 2);
    let mut first = layers[0].clone();
    first.sort();
    assert_eq!(first, vec!["app:a".to_string(), "app:b".to_string()]);
    assert_eq!(layers[1], vec!["app:c".to_string()]);
}

#[test]
fn dependency_cycles_abort_before_any_job_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut workspace = Workspace::new(dir.path()).unwrap();
    workspace.add_job(Job::new("x").depends_on(":y"));
    workspace.add_job(Job::new("y").depends_on(":x"));

    let (mut engine, sink) = engine_with_sink(workspace, ExtensionManager::new());
    let result = engine.build(":x", false);
    let err = result.as_ref().unwrap_err();
    assert_eq!(err.kind(), "internal/cycle-detected");
    assert_eq!(exit_code(&result), 4);

    // the failure happened during graph construction, no job ever started
    assert!(event_values(&sink).iter().all(|event| event["kind"] != "job-started"));
}

#[test]
fn missing_dependencies_name_both_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut workspace = Workspace::new(dir.path()).unwrap();
    workspace.add_job(Job::new("build").depends_on(":ghost"));

    let (mut engine, _sink) = engine_with_sink(workspace, ExtensionManager::new());
    let err = engine.build(":build", false).unwrap_err();
    assert_eq!(err.kind(), "configuration/missing-dependency");
    let message = err.to_string();
    assert!(message.contains(":build") && message.contains(":ghost"), "{message}");
}

#[test]
fn unknown_targets_are_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(dir.path()).unwrap();
    let (mut engine, _sink) = engine_with_sink(workspace, ExtensionManager::new());

    let result = engine.build(":ghost", false);
    assert_eq!(result.as_ref().unwrap_err().kind(), "configuration/unknown-job");
    assert_eq!(exit_code(&result), 3);
}

/// Sets up project `z` with one source file and a blueprinted artifact
/// `z/pkg`.
fn cached_artifact_workspace(
    dir: &Path,
) -> (Workspace, ExtensionManager, Arc<AtomicUsize>) {
    let mut workspace = Workspace::new(dir).unwrap();

    let z_root = project_dir(dir, "z");
    fs::create_dir_all(z_root.join("src")).unwrap();
    fs::write(z_root.join("src/a.txt"), "hello").unwrap();

    let mut z = Project::new(workspace.root(), &z_root).unwrap();
    z.add_source_set(SourceSet::new("sources", z_root.join("src")).include("*.txt"));
    z.add_artifact(Artifact::new("pkg", ComponentUri::parse("tools:pack:binary").unwrap()))
        .unwrap();
    workspace.add_project(z).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let mut extensions = ExtensionManager::new();
    extensions.load(&PackPlugin { runs: runs.clone() }).unwrap();
    (workspace, extensions, runs)
}

#[test]
fn unchanged_artifacts_are_replayed_from_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (workspace, extensions, runs) = cached_artifact_workspace(dir.path());
    let (mut engine, sink) = engine_with_sink(workspace, extensions);

    engine.build("z/pkg:build", false).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let first_events = event_values(&sink);
    assert!(first_events.iter().any(|e| e["kind"] == "cache-miss"));
    let first_log = first_events
        .iter()
        .find(|e| e["kind"] == "script-log" && e["message"] == "packing hello")
        .expect("blueprint logged")
        .clone();

    engine.build("z/pkg:build", false).unwrap();
    // cache hit: the blueprint was not invoked again
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let events = event_values(&sink);
    let second_start = events.iter().rposition(|e| e["kind"] == "build-started").unwrap();
    let replayed = events[second_start..]
        .iter()
        .find(|e| e["kind"] == "script-log" && e["message"] == "packing hello")
        .expect("cached logs are replayed verbatim");
    assert!(events[second_start..].iter().any(|e| e["kind"] == "cache-hit"));
    // same message, fresh context id
    assert_ne!(replayed["context"], first_log["context"]);

    // P7: outputs of both runs are byte-identical
    let index =
        ArtifactCacheIndex::read(&engine.workspace().artifact_index_path()).unwrap();
    assert_eq!(index.len(), 1);
    let (fingerprint, entry) = index.entries.iter().next().unwrap();
    let stored = engine
        .workspace()
        .artifact_store_dir()
        .join(fingerprint)
        .join(&entry.outputs[0]);
    assert_eq!(
        fs::read_to_string(stored).unwrap(),
        strata_build::hash::hash_content("hello")
    );
}

#[test]
fn content_changes_invalidate_the_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let (workspace, extensions, runs) = cached_artifact_workspace(dir.path());
    let (mut engine, _sink) = engine_with_sink(workspace, extensions);

    engine.build("z/pkg:build", false).unwrap();
    fs::write(dir.path().join("z/src/a.txt"), "world").unwrap();
    engine.build("z/pkg:build", false).unwrap();

    // the blueprint ran again and both entries live in the index
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let index =
        ArtifactCacheIndex::read(&engine.workspace().artifact_index_path()).unwrap();
    assert_eq!(index.len(), 2);
}

#[test]
fn invalidate_flag_bypasses_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (workspace, extensions, runs) = cached_artifact_workspace(dir.path());
    let (mut engine, _sink) = engine_with_sink(workspace, extensions);

    engine.build("z/pkg:build", false).unwrap();
    engine.build("z/pkg:build", true).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn artifact_dependencies_schedule_the_other_build_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut workspace = Workspace::new(dir.path()).unwrap();

    for name in ["lib", "app"] {
        let root = project_dir(dir.path(), name);
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/a.txt"), format!("{name} content")).unwrap();
        let mut project = Project::new(workspace.root(), &root).unwrap();
        project
            .add_source_set(SourceSet::new("sources", root.join("src")).include("*.txt"));
        let mut artifact =
            Artifact::new("pkg", ComponentUri::parse("tools:pack:binary").unwrap());
        if name == "app" {
            artifact = artifact.with_dependency(Box::new(
                strata_build::ArtifactDependency::new("lib", "pkg"),
            ));
        }
        project.add_artifact(artifact).unwrap();
        workspace.add_project(project).unwrap();
    }

    let runs = Arc::new(AtomicUsize::new(0));
    let mut extensions = ExtensionManager::new();
    extensions.load(&PackPlugin { runs: runs.clone() }).unwrap();

    let (mut engine, sink) = engine_with_sink(workspace, extensions);
    engine.build("app/pkg:build", false).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        layer_jobs(&sink),
        vec![vec!["lib/pkg:build".to_string()], vec!["app/pkg:build".to_string()]]
    );
}

#[test]
fn background_jobs_only_gate_build_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mut workspace = Workspace::new(dir.path()).unwrap();

    let l_root = project_dir(dir.path(), "l");
    let mut l = Project::new(workspace.root(), l_root).unwrap();
    l.add_job(Job::new("install").with_action(Action::log("installing")));
    l.add_job(
        Job::new("metrics")
            .background()
            .depends_on("l:install")
            .with_action(Action::callable(|_| {
                std::thread::sleep(std::time::Duration::from_millis(150));
                Ok(())
            })),
    );
    l.add_job(
        Job::new("deploy").depends_on("l:install").with_action(Action::log("deploying")),
    );
    workspace.add_project(l).unwrap();

    let (mut engine, sink) = engine_with_sink(workspace, ExtensionManager::new());
    engine.set_workers(2);
    engine.build("l:deploy", false).unwrap();

    let events = event_values(&sink);
    let position = |kind: &str, job: &str| {
        events
            .iter()
            .position(|e| e["kind"] == kind && e["job"] == job)
            .unwrap_or_else(|| panic!("no {kind} event for {job}"))
    };
    let completed = events.iter().position(|e| e["kind"] == "build-completed").unwrap();

    // deploy does not wait for metrics, but build completion does
    assert!(position("job-finished", "l:deploy") < position("job-finished", "l:metrics"));
    assert!(position("job-finished", "l:metrics") < completed);
}

#[test]
fn failing_jobs_fail_the_build_with_the_original_cause() {
    let dir = tempfile::tempdir().unwrap();
    let mut workspace = Workspace::new(dir.path()).unwrap();
    workspace.add_job(
        Job::new("broken")
            .with_action(Action::callable(|_| Err(strata_build::StrataError::msg("exploded")))),
    );

    let (mut engine, sink) = engine_with_sink(workspace, ExtensionManager::new());
    let result = engine.build(":broken", false);
    assert_eq!(exit_code(&result), 2);

    let events = event_values(&sink);
    let failed = events.iter().find(|e| e["kind"] == "build-failed").unwrap();
    assert_eq!(failed["job"], ":broken");
    assert!(failed["error"].as_str().unwrap().contains("exploded"));
}
