//! Executes layered job plans.
//!
//! Layers run strictly in order. Within a layer every blocking job starts
//! concurrently on the worker pool and is awaited at the layer boundary;
//! background jobs are started on dedicated threads and awaited once, after
//! the last layer. On the first failure the executor flips a shared cancel
//! flag: jobs that have not started yet are dropped, running jobs drain, and
//! background jobs are cancelled cooperatively at their next check.

use crate::{
    error::{Result, StrataError},
    events::{ContextId, EventBus, EventLevel, EventPayload},
    graph::ExecutionLayer,
    job::{Action, ActionContext, Job, LogAction, ShellAction},
};
use rayon::prelude::*;
use std::{
    io::BufRead,
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Runs layered execution plans on a thread pool.
pub struct Executor {
    runner: JobRunner,
    pool: rayon::ThreadPool,
}

impl Executor {
    /// Creates an executor with `workers` threads for blocking jobs.
    pub fn new(events: Arc<EventBus>, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("strata-worker-{i}"))
            .build()
            .map_err(|err| StrataError::msg(format!("failed to start worker pool: {err}")))?;
        Ok(Self {
            runner: JobRunner {
                events,
                cancel: Arc::new(AtomicBool::new(false)),
                instances: Arc::new(AtomicU64::new(0)),
            },
            pool,
        })
    }

    /// Executes the layers computed for `target`.
    ///
    /// Returns `build/failed` wrapping the first root cause when any job
    /// fails; background jobs are awaited on every path before the terminal
    /// event is emitted.
    pub fn execute(&self, target: &str, layers: &[ExecutionLayer]) -> Result<()> {
        let events = &self.runner.events;
        events.emit(EventLevel::Info, EventPayload::BuildStarted { target: target.to_string() });
        let started = Instant::now();

        let mut background: Vec<(String, std::thread::JoinHandle<Result<()>>)> = Vec::new();
        let mut failure: Option<(String, StrataError)> = None;

        for (index, layer) in layers.iter().enumerate() {
            if failure.is_some() {
                break;
            }
            events.emit(
                EventLevel::Info,
                EventPayload::BuildLayerStarted { index, jobs: layer.job_ids() },
            );

            let (blocking, detached): (Vec<_>, Vec<_>) =
                layer.jobs().iter().partition(|job| job.is_blocking());

            for job in detached {
                let runner = self.runner.clone();
                let job = job.clone();
                let id = job.id().to_string();
                let handle = std::thread::Builder::new()
                    .name(format!("strata-bg-{id}"))
                    .spawn(move || runner.run(&job))
                    .map_err(|err| StrataError::io(err, "background job thread"))?;
                background.push((id, handle));
            }

            let results: Vec<(String, Result<()>)> = self.pool.install(|| {
                blocking
                    .par_iter()
                    .map(|job| (job.id().to_string(), self.runner.run(job)))
                    .collect()
            });
            for (id, result) in results {
                if let Err(err) = result {
                    record_failure(&mut failure, id, err);
                }
            }

            events.emit(EventLevel::Info, EventPayload::BuildLayerCompleted { index });
        }

        // background jobs are awaited unconditionally, success or failure
        for (id, handle) in background {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => record_failure(&mut failure, id, err),
                Err(_) => record_failure(
                    &mut failure,
                    id.clone(),
                    StrataError::msg(format!("background job `{id}` panicked")),
                ),
            }
        }

        match failure {
            None => {
                let duration = started.elapsed();
                events.emit(
                    EventLevel::Info,
                    EventPayload::BuildCompleted { duration_ms: duration.as_millis() as u64 },
                );
                Ok(())
            }
            Some((job, cause)) => {
                events.emit(
                    EventLevel::Error,
                    EventPayload::BuildFailed { job: Some(job.clone()), error: cause.to_string() },
                );
                Err(StrataError::BuildFailed { job: Some(job), cause: Box::new(cause) })
            }
        }
    }

    /// The shared cancellation flag; exposed so loader-owned callables can
    /// observe it.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.runner.cancel.clone()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("workers", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

/// Cancellation failures never displace the root cause of the build
/// failure.
fn record_failure(
    failure: &mut Option<(String, StrataError)>,
    job: String,
    err: StrataError,
) {
    match failure {
        None => *failure = Some((job, err)),
        Some((_, existing)) if existing.kind() == "build/cancelled" => {
            if err.kind() != "build/cancelled" {
                *failure = Some((job, err));
            }
        }
        Some(_) => {}
    }
}

/// Executes single jobs: context management, action sequencing and terminal
/// events.
#[derive(Clone)]
struct JobRunner {
    events: Arc<EventBus>,
    cancel: Arc<AtomicBool>,
    instances: Arc<AtomicU64>,
}

impl JobRunner {
    fn run(&self, job: &Job) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            // not yet started, dropped silently
            trace!(job = %job.id(), "skipping job, build already cancelled");
            return Ok(());
        }
        let instance = self.instances.fetch_add(1, Ordering::Relaxed) + 1;
        let id = job.id();
        let id_string = id.to_string();

        // the guard releases the context on every exit path
        let _guard = self.events.push_context();
        let context = self.events.current_context();
        self.events.emit_with_context(
            context,
            EventLevel::Info,
            EventPayload::JobStarted { job: id_string.clone(), instance },
        );
        let started = Instant::now();

        for action in job.actions() {
            if self.cancel.load(Ordering::Relaxed) {
                let err = StrataError::Cancelled(id_string.clone());
                self.emit_failed(context, &id_string, &err);
                return Err(err);
            }
            let ctx = ActionContext::new(&self.events, &self.cancel, &id);
            if let Err(err) = self.run_action(action, &ctx, context, &id_string) {
                self.cancel.store(true, Ordering::Relaxed);
                self.emit_failed(context, &id_string, &err);
                return Err(err);
            }
        }

        self.events.emit_with_context(
            context,
            EventLevel::Info,
            EventPayload::JobFinished {
                job: id_string,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        Ok(())
    }

    fn emit_failed(&self, context: Option<ContextId>, job: &str, err: &StrataError) {
        self.events.emit_with_context(
            context,
            EventLevel::Error,
            EventPayload::JobFailed { job: job.to_string(), error: err.to_string() },
        );
    }

    fn run_action(
        &self,
        action: &Action,
        ctx: &ActionContext<'_>,
        context: Option<ContextId>,
        job: &str,
    ) -> Result<()> {
        match action {
            Action::Log(LogAction { message }) => {
                self.events.emit_with_context(
                    context,
                    EventLevel::Info,
                    EventPayload::ScriptLog { message: message.clone() },
                );
                Ok(())
            }
            Action::Callable(callable) => callable.call(ctx),
            Action::Shell(shell) => self.run_shell(shell, context, job),
        }
    }

    fn run_shell(
        &self,
        shell: &ShellAction,
        context: Option<ContextId>,
        job: &str,
    ) -> Result<()> {
        let mut cmd = Command::new(&shell.program);
        cmd.args(&shell.args)
            .current_dir(&shell.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(?cmd, "spawning shell action");
        let mut child = cmd.spawn().map_err(|err| StrataError::io(err, &shell.program))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let status = std::thread::scope(|scope| {
            if let Some(stdout) = stdout {
                scope.spawn(move || {
                    for line in std::io::BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                        self.events.emit_with_context(
                            context,
                            EventLevel::Info,
                            EventPayload::CommandStdout { job: job.to_string(), line },
                        );
                    }
                });
            }
            if let Some(stderr) = stderr {
                scope.spawn(move || {
                    for line in std::io::BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        self.events.emit_with_context(
                            context,
                            EventLevel::Warn,
                            EventPayload::CommandStderr { job: job.to_string(), line },
                        );
                    }
                });
            }

            // poll so the cancel flag is observed while the child runs
            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    let _ = child.kill();
                }
                match child.try_wait() {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                    Err(err) => break Err(StrataError::io(err, &shell.program)),
                }
            }
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(StrataError::CommandFailed { program: shell.program.clone(), status })
        }
    }
}
