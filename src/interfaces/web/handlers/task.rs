use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use super::super::AppState;

/// Remove a task's build directory and drop its cache entry.
pub(crate) async fn delete_task(
    Path(task_id): Path<i64>,
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    match state.worker.send_task_delete(task_id) {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}
