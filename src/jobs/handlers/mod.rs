pub mod python;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::JobRunnerConfig;
use crate::error::{ExecutionError, ProvisioningError};
use crate::jobs::run_manager::RunManager;
use crate::shared::tasks::TaskType;

/// Everything a handler needs to (re)build one task's environment.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub subtype: String,
    pub code_archive: Vec<u8>,
    pub dest_dir: PathBuf,
}

/// Per-run inputs for `TaskHandler::run`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub job_id: i64,
    pub run_id: i64,
    pub task_dir: PathBuf,
    pub input_data: Value,
}

/// Warnings surfaced by a successful build.
pub type BuildWarnings = Vec<String>;

/// Type-specialized build/run/stop implementation for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Deterministically recreate the task's build directory, materialize its
    /// source from the archive and provision an isolated runtime environment.
    async fn init(&self, config: BuildConfig) -> Result<BuildWarnings, ProvisioningError>;

    /// Spawn the task's interpreter. Returns once the process is started; the
    /// terminal outcome flows through the run manager. Callers must not run a
    /// task directory that was never successfully built.
    async fn run(
        &self,
        config: RunConfig,
        manager: Arc<RunManager>,
    ) -> Result<(), ExecutionError>;

    /// Cooperatively interrupt the run's process. No-op when the run is not
    /// active.
    async fn stop(&self, run_id: i64);
}

/// Task type to handler. One Python variant today; dispatch stays closed over
/// the `TaskType` enum.
pub fn handler_registry(config: &JobRunnerConfig) -> HashMap<TaskType, Arc<dyn TaskHandler>> {
    let mut handlers: HashMap<TaskType, Arc<dyn TaskHandler>> = HashMap::new();
    handlers.insert(
        TaskType::Python,
        Arc::new(python::PythonHandler::new(config.clone())),
    );
    handlers
}
