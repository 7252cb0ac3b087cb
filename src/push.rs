use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, error};

use crate::config::PushConfig;
use crate::shared::remote_run::RunData;

/// Per-run remote event names the orchestrator multiplexes on.
pub fn output_event(run_id: i64) -> String {
    format!("run/{run_id}/output")
}
pub fn stop_event(run_id: i64) -> String {
    format!("run/{run_id}/stop")
}
pub fn fail_event(run_id: i64) -> String {
    format!("run/{run_id}/fail")
}
pub fn success_event(run_id: i64) -> String {
    format!("run/{run_id}/success")
}
pub fn access_token_refresh_event(run_id: i64) -> String {
    format!("run/{run_id}/access_token_refresh")
}

/// Outbound client for the orchestrator's push endpoints.
///
/// Status updates and event emits are fire-and-forget: each spawns a bounded
/// retry loop, and exhausted retries are logged and dropped without ever
/// touching run state. Request forwarding is the one synchronous-style call;
/// it reports remote failures as an `error` object instead of failing.
#[derive(Clone)]
pub struct RemotePush {
    client: reqwest::Client,
    base_url: String,
    max_retry_count: u32,
    retry_interval: Duration,
}

impl RemotePush {
    pub fn new(config: &PushConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retry_count: config.max_retry_count,
            retry_interval: Duration::from_secs(config.retry_interval_secs),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Push a run status snapshot, fire-and-forget.
    pub fn run_status_update(
        &self,
        run_id: i64,
        run_data: RunData,
        output: Option<String>,
        errors: Option<String>,
    ) {
        let body = json!({
            "type": "state_update",
            "runId": run_id,
            "status": run_data,
            "output": output,
            "errors": errors,
        });
        self.spawn_push(self.url("status"), body);
    }

    /// Emit a remote run event, fire-and-forget.
    pub fn emit(&self, event_type: String, data: Value) {
        let body = json!({
            "type": "emit",
            "payload": {
                "type": event_type,
                "data": data,
            },
        });
        self.spawn_push(self.url("emit"), body);
    }

    fn spawn_push(&self, url: String, body: Value) {
        let push = self.clone();
        tokio::spawn(async move {
            push.push_attempt_loop(&url, &body).await;
        });
    }

    async fn push_attempt_loop(&self, url: &str, body: &Value) {
        let attempts = self.max_retry_count + 1;
        for attempt in 1..=attempts {
            match self.client.post(url).json(body).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::BAD_REQUEST => {
                    // a malformed push will not become well-formed by retrying
                    error!("Bad request when pushing a message to {url}");
                    debug!("Message body: {body}");
                    return;
                }
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => debug!("Push to {url} returned {}", resp.status()),
                Err(err) => debug!("Push to {url} failed: {err}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        error!("All {attempts} attempts to push a message to {url} have failed");
        debug!("Message body: {body}");
    }

    /// Forward an in-band job request to the orchestrator and hand back its
    /// response. Never fails: the job sees RPC trouble as an `error` field.
    pub async fn forward_request(&self, kind: &str, payload: Value) -> Value {
        let body = json!({
            "type": "request",
            "kind": kind,
            "payload": payload,
        });
        match self.client.post(self.url("request")).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.unwrap_or_else(|err| {
                json!({ "error": format!("malformed orchestrator response: {err}") })
            }),
            Ok(resp) => json!({ "error": format!("orchestrator replied with status {}", resp.status()) }),
            Err(err) => json!({ "error": format!("orchestrator request failed: {err}") }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_push_target(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app_hits = hits.clone();
        let app = axum::Router::new()
            .route(
                "/status",
                post(move |State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    status
                }),
            )
            .with_state(app_hits);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn push_to(base_url: String, max_retry_count: u32) -> RemotePush {
        RemotePush::new(&crate::config::PushConfig {
            base_url,
            max_retry_count,
            retry_interval_secs: 0,
        })
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (base, hits) = spawn_push_target(StatusCode::INTERNAL_SERVER_ERROR).await;
        let push = push_to(base, 2);

        push.push_attempt_loop(
            &push.url("status"),
            &json!({ "type": "state_update", "runId": 1 }),
        )
        .await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let (base, hits) = spawn_push_target(StatusCode::BAD_REQUEST).await;
        let push = push_to(base, 5);

        push.push_attempt_loop(
            &push.url("status"),
            &json!({ "type": "state_update", "runId": 1 }),
        )
        .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_stops_the_loop() {
        let (base, hits) = spawn_push_target(StatusCode::OK).await;
        let push = push_to(base, 5);

        push.push_attempt_loop(
            &push.url("status"),
            &json!({ "type": "state_update", "runId": 1 }),
        )
        .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forward_request_surfaces_rpc_failure_as_error_object() {
        // closed port, connection refused
        let push = push_to("http://127.0.0.1:9".to_string(), 0);
        let reply = push.forward_request("store_state", json!({})).await;
        assert!(reply.get("error").is_some());
    }
}
