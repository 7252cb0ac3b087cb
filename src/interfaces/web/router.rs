use axum::{
    Router,
    routing::{get, post},
};

use super::AppState;
use super::handlers::{run, task};

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/run", post(run::build_and_run))
        .route("/api/run/{run_id}", get(run::run_status).delete(run::delete_run))
        .route("/api/run/{run_id}/stop", post(run::stop_run))
        .route("/api/task/{task_id}", axum::routing::delete(task::delete_task))
        .with_state(state)
}
