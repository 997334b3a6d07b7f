//! SQLite-backed progress store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CadenceError, CadenceResult};
use crate::store::{PendingWrite, ProgressRecord};
use crate::traits::{LocalTier, RemoteTier};

/// Progress records persisted in SQLite.
///
/// Serves as the durable remote tier, and can also back a device-local
/// tier that survives restarts.
pub struct SqliteProgressStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProgressStore {
    /// Open (or create) a store at `db_path`.
    pub fn new(db_path: impl AsRef<Path>) -> CadenceResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| CadenceError::database(e.to_string()))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store.
    pub fn in_memory() -> CadenceResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| CadenceError::database(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> CadenceResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> CadenceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::database(format!("connection lock poisoned: {}", e)))
    }

    fn init_schema(&self) -> CadenceResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS progress_records (
                user_id     TEXT NOT NULL,
                key         TEXT NOT NULL,
                record      TEXT NOT NULL,
                updated_at  TEXT,
                PRIMARY KEY (user_id, key)
            );

            CREATE TABLE IF NOT EXISTS migration_markers (
                user_id      TEXT PRIMARY KEY,
                migrated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_writes (
                user_id     TEXT NOT NULL,
                key         TEXT NOT NULL,
                entry       TEXT NOT NULL,
                PRIMARY KEY (user_id, key)
            );
            "#,
        )?;
        Ok(())
    }

    fn get_record(&self, user_id: &str, key: &str) -> CadenceResult<Option<ProgressRecord>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record FROM progress_records WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                CadenceError::corrupted(format!("record {} for {}: {}", key, user_id, e))
            })
        })
        .transpose()
    }

    fn put_record(&self, user_id: &str, key: &str, record: &ProgressRecord) -> CadenceResult<()> {
        let json = serde_json::to_string(record)?;
        let updated_at = record.updated_at().map(|t| t.to_rfc3339());
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO progress_records (user_id, key, record, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, key) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
            params![user_id, key, json, updated_at],
        )?;
        Ok(())
    }

    fn list_keys(&self, user_id: &str) -> CadenceResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key FROM progress_records WHERE user_id = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn get_marker(&self, user_id: &str) -> CadenceResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT migrated_at FROM migration_markers WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CadenceError::corrupted(format!("migration marker for {}: {}", user_id, e)))
        })
        .transpose()
    }

    fn put_marker(&self, user_id: &str, at: DateTime<Utc>) -> CadenceResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO migration_markers (user_id, migrated_at) VALUES (?1, ?2)",
            params![user_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn put_pending(&self, write: &PendingWrite) -> CadenceResult<()> {
        let json = serde_json::to_string(write)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO pending_writes (user_id, key, entry) VALUES (?1, ?2, ?3)",
            params![write.ctx.user_id, write.key, json],
        )?;
        Ok(())
    }

    fn delete_pending(&self, user_id: &str, key: &str) -> CadenceResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM pending_writes WHERE user_id = ?1 AND key = ?2",
            params![user_id, key],
        )?;
        Ok(())
    }

    fn list_pending(&self) -> CadenceResult<Vec<PendingWrite>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT user_id, key, entry FROM pending_writes ORDER BY user_id, key")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(user_id, key, json)| {
                serde_json::from_str(&json).map_err(|e| {
                    CadenceError::corrupted(format!("pending write {} for {}: {}", key, user_id, e))
                })
            })
            .collect()
    }
}

impl LocalTier for SqliteProgressStore {
    fn get(&self, user_id: &str, key: &str) -> CadenceResult<Option<ProgressRecord>> {
        self.get_record(user_id, key)
    }

    fn put(&self, user_id: &str, key: &str, record: &ProgressRecord) -> CadenceResult<()> {
        self.put_record(user_id, key, record)
    }

    fn keys(&self, user_id: &str) -> CadenceResult<Vec<String>> {
        self.list_keys(user_id)
    }

    fn mark_pending(&self, write: &PendingWrite) -> CadenceResult<()> {
        self.put_pending(write)
    }

    fn clear_pending(&self, user_id: &str, key: &str) -> CadenceResult<()> {
        self.delete_pending(user_id, key)
    }

    fn pending(&self) -> CadenceResult<Vec<PendingWrite>> {
        self.list_pending()
    }
}

#[async_trait]
impl RemoteTier for SqliteProgressStore {
    async fn get(&self, user_id: &str, key: &str) -> CadenceResult<Option<ProgressRecord>> {
        self.get_record(user_id, key)
    }

    async fn put(&self, user_id: &str, key: &str, record: &ProgressRecord) -> CadenceResult<()> {
        self.put_record(user_id, key, record)
    }

    async fn keys(&self, user_id: &str) -> CadenceResult<Vec<String>> {
        self.list_keys(user_id)
    }

    async fn migration_marker(&self, user_id: &str) -> CadenceResult<Option<DateTime<Utc>>> {
        self.get_marker(user_id)
    }

    async fn set_migration_marker(&self, user_id: &str, at: DateTime<Utc>) -> CadenceResult<()> {
        self.put_marker(user_id, at)
    }
}
