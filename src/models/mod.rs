pub mod build_cache;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::StorageError;

/// Shared handle to the worker's SQLite database. Repositories clone this and
/// serialize access through the inner lock.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS job_runs (
                run_id INTEGER PRIMARY KEY,
                output TEXT NOT NULL,
                run_data TEXT NOT NULL,
                err_msg TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_build_cache (
                task_id INTEGER PRIMARY KEY,
                type TEXT NOT NULL,
                subtype TEXT NOT NULL,
                code_hash TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
