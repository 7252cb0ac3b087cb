use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use base64::Engine;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;

use super::super::AppState;
use crate::jobs::scheduler::{BuildSpec, RunSpec};
use crate::shared::tasks::TaskType;

/// Build+run submission. `code` is the base64 task archive; the rest is
/// forwarded to the job untouched.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BuildRunRequest {
    task_id: i64,
    run_id: i64,
    job_id: i64,
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(default)]
    subtype: Option<String>,
    code: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    entities: Value,
    #[serde(default)]
    owned: Value,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    state: Value,
}

pub(crate) async fn build_and_run(
    State(state): State<AppState>,
    Json(body): Json<BuildRunRequest>,
) -> (StatusCode, Json<Value>) {
    let code = match base64::engine::general_purpose::STANDARD.decode(&body.code) {
        Ok(code) => code,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("code is not valid base64: {err}") })),
            );
        }
    };

    let subtype = body.subtype.unwrap_or_default();
    let build = BuildSpec {
        task_id: body.task_id,
        task_type: body.task_type,
        subtype: subtype.clone(),
        code,
        run_id: body.run_id,
    };
    let run = RunSpec {
        run_id: body.run_id,
        task_id: body.task_id,
        job_id: body.job_id,
        task_type: body.task_type,
        params: body.params,
        entities: body.entities,
        owned: body.owned,
        access_token: body.access_token,
        state: body.state,
    };

    match state.worker.send_build_run_bundle(build, run) {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

pub(crate) async fn run_status(
    Path(run_id): Path<i64>,
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    match state.runs.get_by_id(run_id).await {
        Ok(Some(run)) => (
            StatusCode::OK,
            Json(json!({
                "status": run.run_data.status,
                "output": run.output,
                "error": run.err_msg,
            })),
        ),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({}))),
        Err(err) => {
            error!("Run status query failed: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
        }
    }
}

pub(crate) async fn stop_run(
    Path(run_id): Path<i64>,
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    match state.runs.exists(run_id).await {
        Ok(false) => return (StatusCode::NOT_FOUND, Json(json!({}))),
        Err(err) => {
            error!("Stop request error: {err}");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            );
        }
        Ok(true) => {}
    }
    match state.worker.send_stop(run_id) {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

pub(crate) async fn delete_run(
    Path(run_id): Path<i64>,
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    match state.runs.exists(run_id).await {
        Ok(false) => return (StatusCode::NOT_FOUND, Json(json!({}))),
        Err(err) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            );
        }
        Ok(true) => {}
    }
    match state.runs.remove(run_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}
