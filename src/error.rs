use thiserror::Error;

/// Marker recorded against a run when it is cancelled, whether it was still
/// queued or already running.
pub const CANCELLED_MARKER: &str = "Run Cancelled\n";

/// Marker surfaced when the scheduler loses track of a run (missing build
/// bridge or handler entry). The run fails; the worker keeps going.
pub const REMOTE_RUNNER_ERROR: &str = "Remote runner error";

/// A task environment build that did not complete. The dependent run becomes
/// BUILD_FAIL; the captured provisioning output travels with the error.
#[derive(Debug, Error)]
#[error("{}", .errors.join("\n"))]
pub struct ProvisioningError {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// The job process could not be started. Failures after a successful spawn
/// are reported through the run manager instead, with the accumulated error
/// log attached.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to spawn job process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

/// Repository-level failures. Callers log these and carry on: a storage fault
/// must not corrupt in-flight run bookkeeping or crash the worker.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("corrupt run data for run {run_id}: {source}")]
    CorruptRunData {
        run_id: i64,
        source: serde_json::Error,
    },
}
