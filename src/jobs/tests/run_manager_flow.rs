use std::time::Duration;

use super::support::dead_push;
use crate::config::JobRunnerConfig;
use crate::jobs::run_manager::RunManager;
use crate::jobs::scheduler::test_notifier;
use crate::models::Database;
use crate::models::run::RunRepository;
use crate::shared::remote_run::RunStatus;

fn quota_config(max_job_output: usize) -> JobRunnerConfig {
    let mut config = JobRunnerConfig::default();
    config.max_job_output = max_job_output;
    config.output_flush_secs = 0;
    config
}

async fn manager_for(
    run_id: i64,
    config: JobRunnerConfig,
) -> (std::sync::Arc<RunManager>, RunRepository) {
    let runs = RunRepository::new(Database::open_in_memory().unwrap());
    runs.create(run_id).await.unwrap();
    let (notifier, _ping) = test_notifier();
    let manager = RunManager::new(run_id, run_id, None, runs.clone(), dead_push(), config, notifier);
    (manager, runs)
}

#[tokio::test(start_paused = true)]
async fn persisted_output_never_exceeds_the_quota() {
    let (manager, runs) = manager_for(1, quota_config(64)).await;

    let first = "a".repeat(32);
    manager.on_output(&first).await;
    // this chunk crosses the quota and is dropped whole
    manager.on_output(&"b".repeat(40)).await;
    // and everything after it is dropped silently
    manager.on_output(&"b".repeat(8)).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let run = runs.get_by_id(1).await.unwrap().unwrap();
    assert!(run.output.contains(&first));
    assert!(!run.output.contains('b'));
    assert!(run.output.contains("capacity reached"));
}

#[tokio::test(start_paused = true)]
async fn flush_combines_buffered_chunks() {
    let (manager, runs) = manager_for(1, quota_config(1_000_000)).await;

    manager.on_output("one ").await;
    manager.on_output("two").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let run = runs.get_by_id(1).await.unwrap().unwrap();
    assert_eq!(run.output, "one two");
}

#[tokio::test]
async fn success_flushes_and_stamps_the_run() {
    let (manager, runs) = manager_for(1, quota_config(1_000_000)).await;

    manager.on_output("tail output").await;
    manager.on_success(None).await;

    let run = runs.get_by_id(1).await.unwrap().unwrap();
    assert_eq!(run.run_data.status, RunStatus::Success);
    assert!(run.run_data.started_at.is_some());
    assert!(run.run_data.finished_at.is_some());
    assert!(run.output.contains("tail output"));
}

#[tokio::test]
async fn failure_records_the_message_and_stamps_the_run() {
    let (manager, runs) = manager_for(1, quota_config(1_000_000)).await;

    manager.on_fail("went sideways".to_string()).await;

    let run = runs.get_by_id(1).await.unwrap().unwrap();
    assert_eq!(run.run_data.status, RunStatus::RunFail);
    assert!(run.err_msg.contains("went sideways"));
    assert!(run.run_data.finished_at.is_some());
}

#[tokio::test]
async fn requests_are_answered_with_reply_objects() {
    let (manager, _runs) = manager_for(1, quota_config(1_000_000)).await;

    let reply = manager.on_request(r#"{"id": 7, "type": 99}"#).await;
    assert_eq!(reply.get("id").and_then(serde_json::Value::as_i64), Some(7));
    assert!(reply.get("error").is_some());
}
