use serde_json::{Map, Value, json};
use tracing::warn;

use crate::push::RemotePush;

/// In-band request kinds a job may issue over its message stream.
const MSG_TYPE_STORE_STATE: i64 = 1;
const MSG_TYPE_CREATE_SIGNALS: i64 = 2;

/// Field carrying the job state payload in a store-state request.
const STATE_FIELD: &str = "state";

/// Parse one request line into the request value and a reply skeleton with
/// the request id echoed. Parse and shape errors land in the skeleton and
/// yield no request.
fn parse_request(line: &str) -> (Option<Value>, Map<String, Value>) {
    let mut response = Map::new();

    if line.trim().is_empty() {
        response.insert("error".into(), json!("Request not specified"));
        return (None, response);
    }

    let request: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            response.insert("error".into(), json!(format!("Request parsing failed: {err}")));
            return (None, response);
        }
    };

    if let Some(id) = request.get("id") {
        if !id.is_null() {
            response.insert("id".into(), id.clone());
        }
    }

    if request.get("type").is_none() {
        response.insert("error".into(), json!("Type not specified"));
        return (None, response);
    }

    (Some(request), response)
}

fn merge_into(response: &mut Map<String, Value>, remote: Value) {
    if let Value::Object(fields) = remote {
        for (key, value) in fields {
            response.insert(key, value);
        }
    }
}

/// Handle one line from the job's message stream. Always yields a reply
/// object: the job blocks on its reply line, so even errors must answer.
pub async fn handle_request(job_id: i64, push: &RemotePush, line: &str) -> Value {
    let (request, mut response) = parse_request(line);
    let Some(request) = request else {
        return Value::Object(response);
    };

    match request.get("type").and_then(Value::as_i64) {
        Some(MSG_TYPE_STORE_STATE) => {
            if request.get(STATE_FIELD).is_some() {
                let remote = push
                    .forward_request(
                        "store_state",
                        json!({ "jobId": job_id, "state": request[STATE_FIELD] }),
                    )
                    .await;
                merge_into(&mut response, remote);
            } else {
                response.insert("error".into(), json!(format!("{STATE_FIELD} not specified")));
            }
        }
        Some(MSG_TYPE_CREATE_SIGNALS) => {
            if request.get("signalSets").is_some() || request.get("signals").is_some() {
                let remote = push
                    .forward_request(
                        "create_signals",
                        json!({
                            "jobId": job_id,
                            "signalSets": request.get("signalSets"),
                            "signals": request.get("signals"),
                        }),
                    )
                    .await;
                merge_into(&mut response, remote);
            } else {
                response.insert(
                    "error".into(),
                    json!("Either signalSets or signals have to be specified"),
                );
            }
        }
        _ => {
            warn!("Job {job_id}: unrecognized request type {}", request["type"]);
            response.insert(
                "error".into(),
                json!(format!("Type {} not recognized", request["type"])),
            );
        }
    }

    Value::Object(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushConfig;

    /// Points at a closed port; local-error paths never reach it.
    fn dead_push() -> RemotePush {
        RemotePush::new(&PushConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            max_retry_count: 0,
            retry_interval_secs: 0,
        })
    }

    #[tokio::test]
    async fn unknown_type_yields_error_reply() {
        let reply = handle_request(1, &dead_push(), r#"{"type": 99}"#).await;
        let error = reply.get("error").and_then(Value::as_str).unwrap();
        assert!(error.contains("99"));
        assert!(error.contains("not recognized"));
    }

    #[tokio::test]
    async fn parse_failure_yields_error_reply() {
        let reply = handle_request(1, &dead_push(), "this is not json").await;
        let error = reply.get("error").and_then(Value::as_str).unwrap();
        assert!(error.contains("parsing failed"));
    }

    #[tokio::test]
    async fn empty_line_yields_error_reply() {
        let reply = handle_request(1, &dead_push(), "").await;
        assert!(reply.get("error").is_some());
    }

    #[tokio::test]
    async fn missing_type_yields_error_reply() {
        let reply = handle_request(1, &dead_push(), r#"{"id": 4}"#).await;
        let error = reply.get("error").and_then(Value::as_str).unwrap();
        assert!(error.contains("Type not specified"));
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let reply = handle_request(1, &dead_push(), r#"{"id": 4, "type": 99}"#).await;
        assert_eq!(reply.get("id").and_then(Value::as_i64), Some(4));
    }

    #[tokio::test]
    async fn store_state_requires_the_state_field() {
        let reply = handle_request(1, &dead_push(), r#"{"type": 1}"#).await;
        let error = reply.get("error").and_then(Value::as_str).unwrap();
        assert!(error.contains("state not specified"));
    }

    #[tokio::test]
    async fn create_signals_requires_a_payload() {
        let reply = handle_request(1, &dead_push(), r#"{"type": 2}"#).await;
        let error = reply.get("error").and_then(Value::as_str).unwrap();
        assert!(error.contains("signalSets or signals"));
    }
}
