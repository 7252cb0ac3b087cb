use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::error::{CANCELLED_MARKER, REMOTE_RUNNER_ERROR};
use crate::jobs::handlers::{BuildConfig, RunConfig, TaskHandler};
use crate::jobs::run_manager::RunManager;
use crate::models::build_cache::BuildCacheRepository;
use crate::models::run::RunRepository;
use crate::push::{self, RemotePush};
use crate::shared::remote_run::{RunData, RunStatus};
use crate::shared::tasks::{TaskType, task_dir};

/// One build request as received over the control channel.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub task_id: i64,
    pub task_type: TaskType,
    pub subtype: String,
    pub code: Vec<u8>,
    pub run_id: i64,
}

/// One run request as received over the control channel.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: i64,
    pub task_id: i64,
    pub job_id: i64,
    pub task_type: TaskType,
    pub params: Value,
    pub entities: Value,
    pub owned: Value,
    pub access_token: Option<String>,
    pub state: Value,
}

/// Control-channel events. Stops are handled on receipt and never queued.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Build(BuildSpec),
    Run(RunSpec),
    Stop { run_id: i64 },
    TaskDelete { task_id: i64 },
}

enum SchedulerMsg {
    Event(WorkerEvent),
    BuildRunBundle(Box<(BuildSpec, RunSpec)>),
    RunFinished(i64),
}

/// Outcome of a build, bridged to its dependent run and consumed exactly once.
#[derive(Debug, Clone)]
struct BuildOutcome {
    can_run: bool,
    warnings: String,
    errors: String,
}

/// The scheduler task is gone; the worker cannot accept control messages.
#[derive(Debug, thiserror::Error)]
#[error("worker scheduler is not running")]
pub struct WorkerUnavailable;

/// Clonable front door to the scheduler actor.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
}

impl WorkerHandle {
    pub fn send_event(&self, event: WorkerEvent) -> Result<(), WorkerUnavailable> {
        self.tx
            .send(SchedulerMsg::Event(event))
            .map_err(|_| WorkerUnavailable)
    }

    /// Submit a build and its dependent run as one atomic pair: the scheduler
    /// enqueues both inside a single message, so no other event for the task
    /// can slip between them.
    pub fn send_build_run_bundle(
        &self,
        build: BuildSpec,
        run: RunSpec,
    ) -> Result<(), WorkerUnavailable> {
        self.tx
            .send(SchedulerMsg::BuildRunBundle(Box::new((build, run))))
            .map_err(|_| WorkerUnavailable)
    }

    pub fn send_stop(&self, run_id: i64) -> Result<(), WorkerUnavailable> {
        self.send_event(WorkerEvent::Stop { run_id })
    }

    pub fn send_task_delete(&self, task_id: i64) -> Result<(), WorkerUnavailable> {
        self.send_event(WorkerEvent::TaskDelete { task_id })
    }
}

/// Lets a run manager tell the scheduler its run is finished without touching
/// scheduler state directly.
#[derive(Clone)]
pub struct SchedulerNotifier {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
}

impl SchedulerNotifier {
    pub(crate) fn run_finished(&self, run_id: i64) {
        let _ = self.tx.send(SchedulerMsg::RunFinished(run_id));
    }
}

/// The worker's event loop. Owns the work queue, the build bridge and the
/// running-handler map exclusively; everything else talks to it through the
/// control channel, so none of that state needs a lock.
pub struct Scheduler {
    rx: mpsc::UnboundedReceiver<SchedulerMsg>,
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    queue: VecDeque<WorkerEvent>,
    bridge: HashMap<i64, BuildOutcome>,
    running: HashMap<i64, Arc<dyn TaskHandler>>,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    runs: RunRepository,
    cache: BuildCacheRepository,
    push: RemotePush,
    config: RunnerConfig,
}

impl Scheduler {
    pub fn spawn(
        handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
        runs: RunRepository,
        cache: BuildCacheRepository,
        push: RemotePush,
        config: RunnerConfig,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle { tx: tx.clone() };
        let scheduler = Scheduler {
            rx,
            tx,
            queue: VecDeque::new(),
            bridge: HashMap::new(),
            running: HashMap::new(),
            handlers,
            runs,
            cache,
            push,
            config,
        };
        tokio::spawn(scheduler.run_loop());
        handle
    }

    async fn run_loop(mut self) {
        loop {
            if let Some(event) = self.queue.pop_front() {
                self.dispatch(event).await;
            } else {
                match self.rx.recv().await {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                }
            }
            // apply already-delivered control messages before the next
            // dispatch, so a stop can still beat its queued run
            while let Ok(msg) = self.rx.try_recv() {
                self.handle_message(msg).await;
            }
        }
        info!("Worker scheduler stopped");
    }

    async fn handle_message(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Event(WorkerEvent::Stop { run_id }) => self.handle_stop(run_id).await,
            SchedulerMsg::Event(WorkerEvent::Run(spec)) => {
                if let Err(err) = self.runs.create(spec.run_id).await {
                    error!("Could not create run {}: {err}", spec.run_id);
                }
                self.queue.push_back(WorkerEvent::Run(spec));
            }
            SchedulerMsg::Event(event) => self.queue.push_back(event),
            SchedulerMsg::BuildRunBundle(bundle) => {
                let (build, run) = *bundle;
                if let Err(err) = self.runs.create(run.run_id).await {
                    error!("Could not create run {}: {err}", run.run_id);
                }
                // both halves land in the queue within this one message
                self.queue.push_back(WorkerEvent::Build(build));
                self.queue.push_back(WorkerEvent::Run(run));
            }
            SchedulerMsg::RunFinished(run_id) => {
                self.running.remove(&run_id);
            }
        }
    }

    async fn dispatch(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Build(spec) => self.dispatch_build(spec).await,
            WorkerEvent::Run(spec) => self.dispatch_run(spec).await,
            WorkerEvent::TaskDelete { task_id } => self.dispatch_task_delete(task_id).await,
            WorkerEvent::Stop { run_id } => self.handle_stop(run_id).await,
        }
    }

    /// A build occupies the dispatch position until it resolves, so two
    /// builds of the same task can never race. Control messages keep flowing
    /// while the build future is in flight: a run queued behind this build
    /// can still be cancelled.
    async fn dispatch_build(&mut self, spec: BuildSpec) {
        let run_id = spec.run_id;
        let build = Self::run_build(
            self.handlers.get(&spec.task_type).cloned(),
            self.cache.clone(),
            self.config.worker.build_dir.clone(),
            spec,
        );
        tokio::pin!(build);

        let mut inbox_open = true;
        let outcome = loop {
            if inbox_open {
                tokio::select! {
                    outcome = &mut build => break outcome,
                    msg = self.rx.recv() => match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => inbox_open = false,
                    },
                }
            } else {
                break (&mut build).await;
            }
        };
        self.bridge.insert(run_id, outcome);
    }

    /// Cache-checked build. Touches no scheduler state; the result goes to
    /// the bridge.
    async fn run_build(
        handler: Option<Arc<dyn TaskHandler>>,
        cache: BuildCacheRepository,
        build_dir: PathBuf,
        spec: BuildSpec,
    ) -> BuildOutcome {
        let BuildSpec {
            task_id,
            task_type,
            subtype,
            code,
            ..
        } = spec;

        match cache.is_cached(task_id, task_type, &subtype, &code).await {
            Ok(true) => {
                return BuildOutcome {
                    can_run: true,
                    warnings: String::new(),
                    errors: String::new(),
                };
            }
            Ok(false) => {}
            // an unreadable cache behaves like a miss
            Err(err) => error!("Build cache lookup for task {task_id} failed: {err}"),
        }

        // invalid before any work: a crash mid-build must never leave a
        // stale valid entry behind
        if let Err(err) = cache.invalidate(task_id).await {
            error!("Build cache invalidation for task {task_id} failed: {err}");
        }

        let Some(handler) = handler else {
            return BuildOutcome {
                can_run: false,
                warnings: String::new(),
                errors: format!("task type {} not recognised", task_type.as_str()),
            };
        };

        let dest_dir = task_dir(&build_dir, task_id);
        match handler
            .init(BuildConfig {
                subtype: subtype.clone(),
                code_archive: code.clone(),
                dest_dir,
            })
            .await
        {
            Ok(build_warnings) => {
                if let Err(err) = cache.update(task_id, task_type, &subtype, &code).await {
                    error!("Build cache update for task {task_id} failed: {err}");
                }
                BuildOutcome {
                    can_run: true,
                    warnings: format_warnings(&build_warnings),
                    errors: String::new(),
                }
            }
            Err(err) => BuildOutcome {
                can_run: false,
                warnings: format_warnings(&err.warnings),
                errors: format_errors(&err.errors),
            },
        }
    }

    async fn dispatch_run(&mut self, spec: RunSpec) {
        let run_id = spec.run_id;

        let Some(outcome) = self.bridge.remove(&run_id) else {
            // the BUILD half never reported; fail the run, not the worker
            self.fail_without_manager(run_id, REMOTE_RUNNER_ERROR).await;
            return;
        };

        if !outcome.can_run {
            match self.runs.set_state(run_id, RunStatus::BuildFail).await {
                Ok(true) => {}
                Ok(false) => warn!("Could not mark run {run_id} as build-failed"),
                Err(err) => error!("Could not mark run {run_id} as build-failed: {err}"),
            }
            self.push.emit(
                push::fail_event(run_id),
                json!(format!(
                    "Remote Build Failed\n{}{}",
                    outcome.warnings, outcome.errors
                )),
            );
            return;
        }

        if !outcome.warnings.is_empty() {
            if let Err(err) = self.runs.append_output(run_id, &outcome.warnings).await {
                error!("Could not record build warnings for run {run_id}: {err}");
            }
            self.push
                .emit(push::output_event(run_id), json!(outcome.warnings.clone()));
        }

        let Some(handler) = self.handlers.get(&spec.task_type).cloned() else {
            self.fail_without_manager(
                run_id,
                &format!("handler for task type {} not found", spec.task_type.as_str()),
            )
            .await;
            return;
        };

        match self.runs.set_state(run_id, RunStatus::Running).await {
            Ok(true) => {}
            Ok(false) => warn!("Could not mark run {run_id} as running"),
            Err(err) => error!("Could not mark run {run_id} as running: {err}"),
        }
        self.push.run_status_update(
            run_id,
            RunData {
                status: RunStatus::Running,
                started_at: None,
                finished_at: None,
            },
            None,
            None,
        );

        let manager = RunManager::new(
            spec.job_id,
            run_id,
            spec.access_token.clone(),
            self.runs.clone(),
            self.push.clone(),
            self.config.runner.clone(),
            SchedulerNotifier {
                tx: self.tx.clone(),
            },
        );

        let run_config = RunConfig {
            job_id: spec.job_id,
            run_id,
            task_dir: task_dir(&self.config.worker.build_dir, spec.task_id),
            input_data: json!({
                "context": { "jobId": spec.job_id },
                "params": spec.params,
                "entities": spec.entities,
                "owned": spec.owned,
                "accessToken": spec.access_token,
                "state": spec.state,
            }),
        };

        // fire-and-continue: the process runs on its own, the loop moves on
        match handler.run(run_config, manager.clone()).await {
            Ok(()) => {
                self.running.insert(run_id, handler);
            }
            Err(err) => {
                error!("Job process for run {run_id} could not be started: {err}");
                manager.on_fail(err.to_string()).await;
            }
        }
    }

    /// Stop semantics: a still-queued run is cancelled for free; a running
    /// one gets a cooperative interrupt and finishes through its own failure
    /// path; anything else is a consistency error worth logging only.
    async fn handle_stop(&mut self, run_id: i64) {
        let before = self.queue.len();
        self.queue.retain(|event| match event {
            WorkerEvent::Build(spec) => spec.run_id != run_id,
            WorkerEvent::Run(spec) => spec.run_id != run_id,
            _ => true,
        });

        if self.queue.len() != before {
            self.bridge.remove(&run_id);
            self.cancel_queued_run(run_id).await;
            self.push.emit(push::stop_event(run_id), Value::Null);
            return;
        }

        if let Some(handler) = self.running.get(&run_id).cloned() {
            if let Err(err) = self.runs.append_error(run_id, CANCELLED_MARKER).await {
                error!("Stop handling error for run {run_id}: {err}");
            }
            // all further bookkeeping happens in the run manager's failure
            // path once the interrupted process exits
            handler.stop(run_id).await;
            self.push.emit(push::stop_event(run_id), Value::Null);
        } else {
            error!("Stop requested for run {run_id}, which is neither queued nor running");
        }
    }

    /// Cancellation of a run that never started. The run row may not exist
    /// yet; removing the event from the queue first means no double create.
    async fn cancel_queued_run(&self, run_id: i64) {
        if let Err(err) = self.runs.create(run_id).await {
            error!("Stop handling error for run {run_id}: {err}");
        }
        if let Err(err) = self.runs.append_error(run_id, CANCELLED_MARKER).await {
            error!("Stop handling error for run {run_id}: {err}");
        }
        match self.runs.set_state(run_id, RunStatus::RunFail).await {
            Ok(true) => {}
            Ok(false) => warn!("Could not change run state on stop"),
            Err(err) => error!("Stop handling error for run {run_id}: {err}"),
        }
        let log = match self.runs.get_by_id(run_id).await {
            Ok(Some(run)) => run.output,
            _ => String::new(),
        };
        self.push.run_status_update(
            run_id,
            RunData {
                status: RunStatus::RunFail,
                started_at: None,
                finished_at: Some(Utc::now()),
            },
            Some(format!("{CANCELLED_MARKER}\nLog:\n{log}")),
            None,
        );
    }

    /// Terminal failure for a run that never got a run manager.
    async fn fail_without_manager(&self, run_id: i64, err_msg: &str) {
        if let Err(err) = self.runs.append_error(run_id, err_msg).await {
            error!("Could not append error for run {run_id}: {err}");
        }
        let run_data = RunData {
            status: RunStatus::RunFail,
            started_at: None,
            finished_at: Some(Utc::now()),
        };
        match self.runs.set_run_data(run_id, &run_data).await {
            Ok(true) => {}
            Ok(false) => error!("Could not save run data when failing run {run_id}"),
            Err(err) => error!("Could not save run data when failing run {run_id}: {err}"),
        }
        let output = match self.runs.get_by_id(run_id).await {
            Ok(Some(run)) => run.output,
            _ => String::new(),
        };
        self.push.run_status_update(
            run_id,
            run_data,
            Some(format!("{err_msg}\n\nLog:\n{output}")),
            None,
        );
        self.push.emit(push::fail_event(run_id), json!(err_msg));
    }

    async fn dispatch_task_delete(&mut self, task_id: i64) {
        // a deleted build directory must not look cached
        if let Err(err) = self.cache.invalidate(task_id).await {
            error!("Build cache invalidation for task {task_id} failed: {err}");
        }
        let dir = task_dir(&self.config.worker.build_dir, task_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!("Removed build directory for task {task_id}"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => error!("Could not remove build directory for task {task_id}: {err}"),
        }
    }
}

fn format_warnings(warnings: &[String]) -> String {
    if warnings.is_empty() {
        String::new()
    } else {
        format!("REMOTE BUILD WARNINGS:\n{}\n", warnings.join("\n"))
    }
}

fn format_errors(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!("REMOTE BUILD ERRORS:\n{}\n", errors.join("\n"))
    }
}

#[cfg(test)]
pub(crate) fn test_notifier() -> (SchedulerNotifier, mpsc::UnboundedReceiver<()>) {
    // adapter used by run-manager tests: surfaces run-finished pings without
    // a full scheduler
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (ping_tx, ping_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let SchedulerMsg::RunFinished(_) = msg {
                let _ = ping_tx.send(());
            }
        }
    });
    (SchedulerNotifier { tx }, ping_rx)
}
