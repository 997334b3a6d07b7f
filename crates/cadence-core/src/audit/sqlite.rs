//! Audit log persisted in SQLite.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CadenceError, CadenceResult};
use crate::traits::{AuditEntry, AuditSink};

/// Append-only audit table.
///
/// Entries are stored as JSON next to the columns needed to query them.
pub struct SqliteAuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditLog {
    /// Open (or create) an audit log at `db_path`.
    pub fn new(db_path: impl AsRef<Path>) -> CadenceResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = if db_path.as_ref().to_str() == Some(":memory:") {
            Connection::open_in_memory()
        } else {
            Connection::open(db_path.as_ref())
        }
        .map_err(|e| CadenceError::database(e.to_string()))?;

        let log = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        log.create_table()?;
        Ok(log)
    }

    /// Create an in-memory audit log.
    pub fn in_memory() -> CadenceResult<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> CadenceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::database(format!("connection lock poisoned: {}", e)))
    }

    fn create_table(&self) -> CadenceResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                kind        TEXT NOT NULL,
                entry       TEXT NOT NULL,
                logged_at   TEXT NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id, logged_at)",
            [],
        )?;
        Ok(())
    }
}

impl AuditSink for SqliteAuditLog {
    fn append(&self, entry: &AuditEntry) -> CadenceResult<()> {
        let json = serde_json::to_string(entry)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (id, user_id, kind, entry, logged_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id().to_string(),
                entry.user_id(),
                entry.kind(),
                json,
                entry.timestamp().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn for_user(&self, user_id: &str, limit: usize) -> CadenceResult<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT entry FROM audit_log
            WHERE user_id = ?1
            ORDER BY logged_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| {
                serde_json::from_str(json)
                    .map_err(|e| CadenceError::corrupted(format!("audit entry: {}", e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::PolicyViolationEntry;
    use crate::types::{
        Actor, DecisionReason, EntitlementDecision, EntitlementLogEntry, Feature, Plan,
    };
    use chrono::{Duration, TimeZone, Utc};

    fn decision_entry(user: &str, minutes: i64) -> AuditEntry {
        let at = Utc.with_ymd_and_hms(2024, 1, 21, 9, 0, 0).unwrap() + Duration::minutes(minutes);
        AuditEntry::Entitlement(EntitlementLogEntry::new(
            Actor::User(user.to_string()),
            EntitlementDecision {
                user_id: user.to_string(),
                feature: Feature::KanjiPractice,
                plan: Plan::Free,
                allow: true,
                remaining: 9,
                reset_at_utc: None,
                reason: DecisionReason::Allowed,
                evaluated_at: at,
                simulated: false,
            },
            at,
        ))
    }

    #[test]
    fn test_entries_newest_first() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let first = decision_entry("u1", 0);
        let second = AuditEntry::PolicyViolation(PolicyViolationEntry::new(
            "u1",
            Plan::Free,
            "stats",
            "flush",
            Utc.with_ymd_and_hms(2024, 1, 21, 9, 5, 0).unwrap(),
        ));
        log.append(&first).unwrap();
        log.append(&second).unwrap();
        log.append(&decision_entry("u2", 1)).unwrap();

        let entries = log.for_user("u1", 10).unwrap();
        assert_eq!(entries, vec![second, first]);
        assert_eq!(log.for_user("u1", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_log_matches_sqlite_ordering() {
        let log = crate::audit::MemoryAuditLog::new();
        log.append(&decision_entry("u1", 0)).unwrap();
        log.append(&decision_entry("u1", 1)).unwrap();
        let entries = log.for_user("u1", 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].timestamp() > entries[1].timestamp());
    }
}
