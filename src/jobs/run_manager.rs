use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::JobRunnerConfig;
use crate::jobs::ipc;
use crate::jobs::scheduler::SchedulerNotifier;
use crate::models::run::RunRepository;
use crate::push::{self, RemotePush};
use crate::shared::remote_run::{RunData, RunStatus};

/// Pending output between flushes; one lock covers all of it.
struct OutputState {
    buffer: Vec<String>,
    bytes: usize,
    limit_reached: bool,
    flush_scheduled: bool,
}

/// Per-run event sink. Buffers job output against a quota, answers in-band
/// requests, keeps the access token fresh and finalizes the run exactly once
/// through `on_success` or `on_fail`.
pub struct RunManager {
    job_id: i64,
    run_id: i64,
    runs: RunRepository,
    push: RemotePush,
    config: JobRunnerConfig,
    output: Mutex<OutputState>,
    refresh: CancellationToken,
    started_at: DateTime<Utc>,
    notifier: SchedulerNotifier,
}

impl RunManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: i64,
        run_id: i64,
        access_token: Option<String>,
        runs: RunRepository,
        push: RemotePush,
        config: JobRunnerConfig,
        notifier: SchedulerNotifier,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            job_id,
            run_id,
            runs,
            push,
            config,
            output: Mutex::new(OutputState {
                buffer: Vec::new(),
                bytes: 0,
                limit_reached: false,
                flush_scheduled: false,
            }),
            refresh: CancellationToken::new(),
            started_at: Utc::now(),
            notifier,
        });
        if let Some(token) = access_token {
            manager.spawn_token_refresh(token);
        }
        manager
    }

    /// Periodic refresh events for the run's access token, until terminal.
    fn spawn_token_refresh(&self, token: String) {
        let push = self.push.clone();
        let run_id = self.run_id;
        let cancel = self.refresh.clone();
        let interval = Duration::from_secs(self.config.token_refresh_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        push.emit(
                            push::access_token_refresh_event(run_id),
                            json!({ "accessToken": token }),
                        );
                    }
                }
            }
        });
    }

    /// Buffer one stdout chunk. The first chunk after a flush schedules the
    /// next one; past the quota everything is dropped.
    pub async fn on_output(self: &Arc<Self>, data: &str) {
        let mut state = self.output.lock().await;
        if state.limit_reached {
            return;
        }
        state.bytes += data.len();
        if state.bytes >= self.config.max_job_output {
            state.limit_reached = true;
            drop(state);
            if self.config.print_limit_reached_message {
                const LIMIT_MSG: &str = "INFO: max output storage capacity reached\n";
                if let Err(err) = self.runs.append_output(self.run_id, LIMIT_MSG).await {
                    error!("Output handling for run {} failed: {err}", self.run_id);
                }
                self.push
                    .emit(push::output_event(self.run_id), json!(LIMIT_MSG));
            }
            return;
        }
        state.buffer.push(data.to_string());
        if !state.flush_scheduled {
            state.flush_scheduled = true;
            drop(state);
            self.schedule_flush();
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let manager = self.clone();
        let delay = Duration::from_secs(self.config.output_flush_secs);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.flush_output().await;
        });
    }

    /// Drain the buffer: one combined repository append plus one remote
    /// output event per flush, not one per chunk.
    async fn flush_output(&self) {
        let drained = {
            let mut state = self.output.lock().await;
            state.flush_scheduled = false;
            std::mem::take(&mut state.buffer)
        };
        if drained.is_empty() {
            return;
        }
        let combined = drained.concat();
        if let Err(err) = self.runs.append_output(self.run_id, &combined).await {
            error!("Output handling for run {} failed: {err}", self.run_id);
        }
        self.push
            .emit(push::output_event(self.run_id), json!(combined));
    }

    /// In-band request from the job; the only event kind with a reply.
    pub async fn on_request(&self, line: &str) -> Value {
        ipc::handle_request(self.job_id, &self.push, line).await
    }

    pub async fn on_success(&self, final_state: Option<Value>) {
        self.flush_output().await;
        self.refresh.cancel();

        let run_data = RunData {
            status: RunStatus::Success,
            started_at: Some(self.started_at),
            finished_at: Some(Utc::now()),
        };
        match self.runs.set_run_data(self.run_id, &run_data).await {
            Ok(true) => {}
            Ok(false) => warn!("Could not save run data for finished run {}", self.run_id),
            Err(err) => error!("Could not save run data for run {}: {err}", self.run_id),
        }

        if let Some(state) = final_state {
            let reply = self
                .push
                .forward_request("store_state", json!({ "jobId": self.job_id, "state": state }))
                .await;
            if let Some(err) = reply.get("error") {
                warn!("Final state for job {} was not stored: {err}", self.job_id);
            }
        }

        self.push
            .run_status_update(self.run_id, run_data, None, None);
        self.push.emit(push::success_event(self.run_id), Value::Null);
        self.notifier.run_finished(self.run_id);
    }

    pub async fn on_fail(&self, err_msg: String) {
        self.flush_output().await;
        self.refresh.cancel();

        let run_data = RunData {
            status: RunStatus::RunFail,
            started_at: Some(self.started_at),
            finished_at: Some(Utc::now()),
        };
        if let Err(err) = self.runs.append_error(self.run_id, &err_msg).await {
            error!("Could not append error for run {}: {err}", self.run_id);
        }
        match self.runs.set_run_data(self.run_id, &run_data).await {
            Ok(true) => {}
            Ok(false) => error!("Could not save run data when handling run failure"),
            Err(err) => error!("Could not save run data when handling run failure: {err}"),
        }

        match self.runs.get_by_id(self.run_id).await {
            Ok(Some(run)) => self.push.run_status_update(
                self.run_id,
                run_data,
                Some(format!("{err_msg}\n\nLog:\n{}", run.output)),
                None,
            ),
            Ok(None) => error!(
                "Could not push data to the orchestrator, run {} does not exist",
                self.run_id
            ),
            Err(err) => error!("Could not load run {} for the failure push: {err}", self.run_id),
        }

        self.push
            .emit(push::fail_event(self.run_id), json!(err_msg));
        self.notifier.run_finished(self.run_id);
    }
}
