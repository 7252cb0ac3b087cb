use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha512};

use super::Database;
use crate::error::StorageError;
use crate::shared::tasks::TaskType;

/// Hash value no real build can produce; marks an entry as invalid.
const INVALID_HASH: &str = "\0";

fn code_hash(code: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(code);
    hex::encode(hasher.finalize())
}

/// Content-addressed cache of completed task builds. An entry is a hit only
/// when type, subtype and code hash all match; the invalidate-before-build,
/// update-after-success ordering means a crash mid-build leaves the entry
/// invalid rather than stale.
#[derive(Clone)]
pub struct BuildCacheRepository {
    db: Database,
}

impl BuildCacheRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn is_cached(
        &self,
        task_id: i64,
        task_type: TaskType,
        subtype: &str,
        code: &[u8],
    ) -> Result<bool, StorageError> {
        let hash = code_hash(code);
        let conn = self.db.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT task_id FROM task_build_cache \
                 WHERE task_id = ?1 AND type = ?2 AND subtype = ?3 AND code_hash = ?4",
                params![task_id, task_type.as_str(), subtype, hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Force the entry invalid, creating it if absent. Idempotent.
    pub async fn invalidate(&self, task_id: i64) -> Result<(), StorageError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT task_id FROM task_build_cache WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            tx.execute(
                "UPDATE task_build_cache SET code_hash = ?2 WHERE task_id = ?1",
                params![task_id, INVALID_HASH],
            )?;
        } else {
            tx.execute(
                "INSERT INTO task_build_cache (task_id, type, subtype, code_hash) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, INVALID_HASH, INVALID_HASH, INVALID_HASH],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a completed build, creating the entry if absent.
    pub async fn update(
        &self,
        task_id: i64,
        task_type: TaskType,
        subtype: &str,
        code: &[u8],
    ) -> Result<(), StorageError> {
        let hash = code_hash(code);
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT task_id FROM task_build_cache WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            tx.execute(
                "UPDATE task_build_cache SET type = ?2, subtype = ?3, code_hash = ?4 \
                 WHERE task_id = ?1",
                params![task_id, task_type.as_str(), subtype, hash],
            )?;
        } else {
            tx.execute(
                "INSERT INTO task_build_cache (task_id, type, subtype, code_hash) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, task_type.as_str(), subtype, hash],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
