use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::RunnerConfig;
use crate::error::{ExecutionError, ProvisioningError};
use crate::jobs::handlers::{BuildConfig, BuildWarnings, RunConfig, TaskHandler};
use crate::jobs::run_manager::RunManager;
use crate::jobs::scheduler::{BuildSpec, RunSpec, Scheduler, WorkerHandle};
use crate::models::Database;
use crate::models::build_cache::BuildCacheRepository;
use crate::models::run::RunRepository;
use crate::push::RemotePush;
use crate::shared::remote_run::RunStatus;
use crate::shared::tasks::TaskType;

#[derive(Clone)]
pub(crate) enum BuildScript {
    Succeed { warnings: Vec<String> },
    Fail { errors: Vec<String> },
}

/// Task handler with scripted outcomes. Runs stay active until the test
/// finishes them, so every intermediate state is observable.
pub(crate) struct ScriptedHandler {
    build: BuildScript,
    build_delay: Duration,
    init_calls: AtomicUsize,
    run_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    active: Mutex<HashMap<i64, Arc<RunManager>>>,
}

impl ScriptedHandler {
    pub fn with_build(build: BuildScript) -> Arc<Self> {
        Self::with_build_delay(build, Duration::ZERO)
    }

    pub fn succeeding() -> Arc<Self> {
        Self::with_build(BuildScript::Succeed {
            warnings: Vec::new(),
        })
    }

    pub fn with_build_delay(build: BuildScript, build_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            build,
            build_delay,
            init_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Finish an active run the way a real job process exit would. Waits for
    /// the dispatch that registers the run to complete.
    pub async fn finish(&self, run_id: i64, result: Result<(), String>) {
        for _ in 0..500 {
            let manager = self.active.lock().await.remove(&run_id);
            if let Some(manager) = manager {
                match result {
                    Ok(()) => manager.on_success(None).await,
                    Err(msg) => manager.on_fail(msg).await,
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("run {run_id} is not active");
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn init(&self, _config: BuildConfig) -> Result<BuildWarnings, ProvisioningError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.build_delay).await;
        match &self.build {
            BuildScript::Succeed { warnings } => Ok(warnings.clone()),
            BuildScript::Fail { errors } => Err(ProvisioningError {
                warnings: Vec::new(),
                errors: errors.clone(),
            }),
        }
    }

    async fn run(
        &self,
        config: RunConfig,
        manager: Arc<RunManager>,
    ) -> Result<(), ExecutionError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        self.active.lock().await.insert(config.run_id, manager);
        Ok(())
    }

    async fn stop(&self, run_id: i64) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(manager) = self.active.lock().await.remove(&run_id) {
            tokio::spawn(async move {
                manager.on_fail("Interrupted".to_string()).await;
            });
        }
    }
}

/// Worker config pointing pushes at a closed port with no retries.
pub(crate) fn test_runner_config(build_dir: &Path) -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.worker.build_dir = build_dir.to_path_buf();
    config.runner.output_flush_secs = 0;
    config.push.base_url = "http://127.0.0.1:9".to_string();
    config.push.max_retry_count = 0;
    config.push.retry_interval_secs = 0;
    config
}

pub(crate) fn dead_push() -> RemotePush {
    RemotePush::new(&test_runner_config(Path::new(".")).push)
}

pub(crate) struct TestWorker {
    pub handle: WorkerHandle,
    pub runs: RunRepository,
    pub handler: Arc<ScriptedHandler>,
    _build_dir: tempfile::TempDir,
}

pub(crate) fn spawn_test_worker(handler: Arc<ScriptedHandler>) -> TestWorker {
    let build_dir = tempfile::tempdir().unwrap();
    let config = test_runner_config(build_dir.path());

    let db = Database::open_in_memory().unwrap();
    let runs = RunRepository::new(db.clone());
    let cache = BuildCacheRepository::new(db);
    let push = RemotePush::new(&config.push);

    let mut handlers: HashMap<TaskType, Arc<dyn TaskHandler>> = HashMap::new();
    handlers.insert(TaskType::Python, handler.clone());

    let handle = Scheduler::spawn(handlers, runs.clone(), cache, push, config);
    TestWorker {
        handle,
        runs,
        handler,
        _build_dir: build_dir,
    }
}

pub(crate) fn bundle(task_id: i64, run_id: i64) -> (BuildSpec, RunSpec) {
    (
        BuildSpec {
            task_id,
            task_type: TaskType::Python,
            subtype: "subtype0".to_string(),
            code: b"task0".to_vec(),
            run_id,
        },
        RunSpec {
            run_id,
            task_id,
            job_id: run_id,
            task_type: TaskType::Python,
            params: Value::Null,
            entities: Value::Null,
            owned: Value::Null,
            access_token: None,
            state: Value::Null,
        },
    )
}

/// Poll until the run reaches the expected status. Panics when it lands on a
/// different terminal state instead, so illegal transitions fail fast.
pub(crate) async fn wait_for_status(runs: &RunRepository, run_id: i64, expected: RunStatus) {
    for _ in 0..500 {
        if let Some(run) = runs.get_by_id(run_id).await.unwrap() {
            let status = run.run_data.status;
            if status == expected {
                return;
            }
            assert!(
                !status.is_terminal(),
                "run {run_id} reached terminal {status:?} while waiting for {expected:?}"
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never reached {expected:?}");
}
