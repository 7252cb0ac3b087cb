use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde_json::json;
use tracing::warn;

use super::Database;
use crate::error::StorageError;
use crate::push::{self, RemotePush};
use crate::shared::remote_run::{RunData, RunStatus};

/// A materialized row of the `job_runs` table.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: i64,
    pub output: String,
    pub run_data: RunData,
    pub err_msg: String,
}

#[derive(Clone)]
pub struct RunRepository {
    db: Database,
}

impl RunRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn exists(&self, run_id: i64) -> Result<bool, StorageError> {
        let conn = self.db.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT run_id FROM job_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Create a queued run row. Returns false when the run already exists.
    pub async fn create(&self, run_id: i64) -> Result<bool, StorageError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT run_id FROM job_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            return Ok(false);
        }
        let run_data = encode_run_data(run_id, &RunData::queued())?;
        tx.execute(
            "INSERT INTO job_runs (run_id, output, run_data, err_msg) VALUES (?1, '', ?2, '')",
            params![run_id, run_data],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn get_by_id(&self, run_id: i64) -> Result<Option<Run>, StorageError> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT run_id, output, run_data, err_msg FROM job_runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((run_id, output, data, err_msg)) => {
                let run_data = decode_run_data(run_id, &data)?;
                Ok(Some(Run {
                    run_id,
                    output,
                    run_data,
                    err_msg,
                }))
            }
        }
    }

    pub async fn remove(&self, run_id: i64) -> Result<(), StorageError> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM job_runs WHERE run_id = ?1", params![run_id])?;
        Ok(())
    }

    /// Patch only the status inside the run's data payload. Returns false
    /// when the run does not exist.
    pub async fn set_state(&self, run_id: i64, status: RunStatus) -> Result<bool, StorageError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let data: Option<String> = tx
            .query_row(
                "SELECT run_data FROM job_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(data) = data else {
            return Ok(false);
        };
        let mut run_data = decode_run_data(run_id, &data)?;
        run_data.status = status;
        let updated = encode_run_data(run_id, &run_data)?;
        tx.execute(
            "UPDATE job_runs SET run_data = ?2 WHERE run_id = ?1",
            params![run_id, updated],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Replace the whole run data payload. Returns false when the run does
    /// not exist.
    pub async fn set_run_data(&self, run_id: i64, run_data: &RunData) -> Result<bool, StorageError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT run_id FROM job_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Ok(false);
        }
        let updated = encode_run_data(run_id, run_data)?;
        tx.execute(
            "UPDATE job_runs SET run_data = ?2 WHERE run_id = ?1",
            params![run_id, updated],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn append_output(&self, run_id: i64, text: &str) -> Result<(), StorageError> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE job_runs SET output = output || ?2 WHERE run_id = ?1",
            params![run_id, text],
        )?;
        Ok(())
    }

    pub async fn append_error(&self, run_id: i64, text: &str) -> Result<(), StorageError> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE job_runs SET err_msg = err_msg || ?2 WHERE run_id = ?1",
            params![run_id, text],
        )?;
        Ok(())
    }

    /// Startup sweep: runs left QUEUED or RUNNING by a previous process can
    /// never finish, so mark them failed and tell the orchestrator.
    pub async fn recover_interrupted(&self, push: &RemotePush) -> Result<(), StorageError> {
        const CANCELLED_OUTPUT: &str = "Cancelled upon start";

        let stale = {
            let conn = self.db.lock().await;
            let mut stmt =
                conn.prepare("SELECT run_id, output, run_data, err_msg FROM job_runs")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut stale = Vec::new();
            for row in rows {
                let (run_id, output, data, err_msg) = row?;
                let run_data = match decode_run_data(run_id, &data) {
                    Ok(run_data) => run_data,
                    Err(err) => {
                        warn!("Skipping unreadable run {run_id} during recovery: {err}");
                        continue;
                    }
                };
                if !run_data.status.is_terminal() {
                    stale.push(Run {
                        run_id,
                        output,
                        run_data,
                        err_msg,
                    });
                }
            }
            stale
        };

        for mut run in stale {
            run.run_data.status = RunStatus::RunFail;
            run.run_data.finished_at = Some(Utc::now());
            let data = encode_run_data(run.run_id, &run.run_data)?;
            {
                let conn = self.db.lock().await;
                // discards any partial output, the orchestrator does the same
                conn.execute(
                    "UPDATE job_runs SET run_data = ?2, output = ?3 WHERE run_id = ?1",
                    params![run.run_id, data, CANCELLED_OUTPUT],
                )?;
            }
            push.run_status_update(
                run.run_id,
                run.run_data.clone(),
                Some(CANCELLED_OUTPUT.to_string()),
                Some(run.err_msg.clone()),
            );
            push.emit(push::fail_event(run.run_id), json!(CANCELLED_OUTPUT));
        }
        Ok(())
    }
}

fn encode_run_data(run_id: i64, run_data: &RunData) -> Result<String, StorageError> {
    serde_json::to_string(run_data).map_err(|source| StorageError::CorruptRunData { run_id, source })
}

fn decode_run_data(run_id: i64, data: &str) -> Result<RunData, StorageError> {
    serde_json::from_str(data).map_err(|source| StorageError::CorruptRunData { run_id, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushConfig;

    fn test_repo() -> RunRepository {
        RunRepository::new(Database::open_in_memory().unwrap())
    }

    fn dead_push() -> RemotePush {
        RemotePush::new(&PushConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            max_retry_count: 0,
            retry_interval_secs: 0,
        })
    }

    #[tokio::test]
    async fn create_is_rejected_for_duplicates() {
        let runs = test_repo();
        assert!(runs.create(7).await.unwrap());
        assert!(!runs.create(7).await.unwrap());
        assert!(runs.exists(7).await.unwrap());
    }

    #[tokio::test]
    async fn new_runs_start_queued_and_empty() {
        let runs = test_repo();
        runs.create(1).await.unwrap();
        let run = runs.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(run.run_data.status, RunStatus::Queued);
        assert!(run.output.is_empty());
        assert!(run.err_msg.is_empty());
    }

    #[tokio::test]
    async fn appends_accumulate() {
        let runs = test_repo();
        runs.create(1).await.unwrap();
        runs.append_output(1, "a").await.unwrap();
        runs.append_output(1, "b").await.unwrap();
        runs.append_error(1, "x").await.unwrap();
        runs.append_error(1, "y").await.unwrap();

        let run = runs.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(run.output, "ab");
        assert_eq!(run.err_msg, "xy");
    }

    #[tokio::test]
    async fn set_state_reports_missing_runs() {
        let runs = test_repo();
        assert!(!runs.set_state(99, RunStatus::Running).await.unwrap());

        runs.create(1).await.unwrap();
        assert!(runs.set_state(1, RunStatus::Running).await.unwrap());
        let run = runs.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(run.run_data.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn remove_deletes_the_row() {
        let runs = test_repo();
        runs.create(1).await.unwrap();
        runs.remove(1).await.unwrap();
        assert!(!runs.exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn recovery_fails_stale_runs_only() {
        let runs = test_repo();
        runs.create(1).await.unwrap();
        runs.create(2).await.unwrap();
        runs.set_state(2, RunStatus::Running).await.unwrap();
        runs.create(3).await.unwrap();
        runs.set_state(3, RunStatus::Success).await.unwrap();

        runs.recover_interrupted(&dead_push()).await.unwrap();

        for stale in [1, 2] {
            let run = runs.get_by_id(stale).await.unwrap().unwrap();
            assert_eq!(run.run_data.status, RunStatus::RunFail);
            assert_eq!(run.output, "Cancelled upon start");
            assert!(run.run_data.finished_at.is_some());
        }
        let untouched = runs.get_by_id(3).await.unwrap().unwrap();
        assert_eq!(untouched.run_data.status, RunStatus::Success);
    }
}
