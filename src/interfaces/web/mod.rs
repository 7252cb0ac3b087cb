mod handlers;
mod router;

use anyhow::Result;
use tracing::info;

use crate::config::RunnerConfig;
use crate::jobs::scheduler::WorkerHandle;
use crate::models::run::RunRepository;

/// Shared state of the HTTP surface: the worker's control channel plus the
/// run repository for status queries.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) worker: WorkerHandle,
    pub(crate) runs: RunRepository,
}

/// Serve the control API until the process ends.
pub async fn serve(config: &RunnerConfig, worker: WorkerHandle, runs: RunRepository) -> Result<()> {
    let state = AppState { worker, runs };
    let app = router::build_router(state);

    let addr = format!("{}:{}", config.worker.host, config.worker.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Job runner listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
