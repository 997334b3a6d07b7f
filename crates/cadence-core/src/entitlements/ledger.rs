//! Usage ledger and admin overrides.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CadenceError, CadenceResult};
use crate::types::Feature;

/// Per-user, per-feature adjustment set by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "per_day", rename_all = "snake_case")]
pub enum FeatureOverride {
    /// Unlimited use regardless of plan.
    Grant,
    /// No use regardless of plan.
    Revoke,
    /// A custom daily limit replacing the plan's.
    Limit(u32),
}

/// Daily usage counts per user and feature.
pub trait UsageLedger: Send + Sync {
    /// Uses recorded on `day`.
    fn usage(&self, user_id: &str, feature: Feature, day: NaiveDate) -> CadenceResult<u32>;

    /// Add `count` uses on `day` and return the new total.
    fn record(&self, user_id: &str, feature: Feature, day: NaiveDate, count: u32)
        -> CadenceResult<u32>;
}

/// Admin overrides per user and feature.
pub trait OverrideStore: Send + Sync {
    fn get_override(&self, user_id: &str, feature: Feature) -> CadenceResult<Option<FeatureOverride>>;

    /// Set an override, or clear it with `None`.
    fn set_override(
        &self,
        user_id: &str,
        feature: Feature,
        value: Option<FeatureOverride>,
    ) -> CadenceResult<()>;

    /// Every override set for a user.
    fn overrides_for(&self, user_id: &str) -> CadenceResult<Vec<(Feature, FeatureOverride)>>;
}

/// SQLite store backing both the usage ledger and the override table.
pub struct SqliteEntitlementStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEntitlementStore {
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
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS usage_ledger (
                user_id  TEXT NOT NULL,
                feature  TEXT NOT NULL,
                day      TEXT NOT NULL,
                count    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, feature, day)
            );

            CREATE TABLE IF NOT EXISTS feature_overrides (
                user_id  TEXT NOT NULL,
                feature  TEXT NOT NULL,
                value    TEXT NOT NULL,
                PRIMARY KEY (user_id, feature)
            );
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> CadenceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::database(format!("connection lock poisoned: {}", e)))
    }
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

impl UsageLedger for SqliteEntitlementStore {
    fn usage(&self, user_id: &str, feature: Feature, day: NaiveDate) -> CadenceResult<u32> {
        let conn = self.conn()?;
        let count: Option<u32> = conn
            .query_row(
                "SELECT count FROM usage_ledger WHERE user_id = ?1 AND feature = ?2 AND day = ?3",
                params![user_id, feature.to_string(), day_key(day)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    fn record(
        &self,
        user_id: &str,
        feature: Feature,
        day: NaiveDate,
        count: u32,
    ) -> CadenceResult<u32> {
        let conn = self.conn()?;
        let total = conn.query_row(
            r#"
            INSERT INTO usage_ledger (user_id, feature, day, count)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, feature, day) DO UPDATE SET count = count + excluded.count
            RETURNING count
            "#,
            params![user_id, feature.to_string(), day_key(day), count],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

impl OverrideStore for SqliteEntitlementStore {
    fn get_override(&self, user_id: &str, feature: Feature) -> CadenceResult<Option<FeatureOverride>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM feature_overrides WHERE user_id = ?1 AND feature = ?2",
                params![user_id, feature.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| CadenceError::corrupted(format!("override for {}: {}", user_id, e)))
        })
        .transpose()
    }

    fn set_override(
        &self,
        user_id: &str,
        feature: Feature,
        value: Option<FeatureOverride>,
    ) -> CadenceResult<()> {
        let conn = self.conn()?;
        match value {
            Some(value) => {
                conn.execute(
                    "INSERT OR REPLACE INTO feature_overrides (user_id, feature, value) VALUES (?1, ?2, ?3)",
                    params![user_id, feature.to_string(), serde_json::to_string(&value)?],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM feature_overrides WHERE user_id = ?1 AND feature = ?2",
                    params![user_id, feature.to_string()],
                )?;
            }
        }
        Ok(())
    }

    fn overrides_for(&self, user_id: &str) -> CadenceResult<Vec<(Feature, FeatureOverride)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT feature, value FROM feature_overrides WHERE user_id = ?1 ORDER BY feature",
        )?;
        let rows = stmt
            .query_map([user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(feature, value)| {
                let feature = Feature::from_str(&feature)
                    .map_err(|e| CadenceError::corrupted(format!("feature {}: {}", feature, e)))?;
                let value = serde_json::from_str(&value)
                    .map_err(|e| CadenceError::corrupted(format!("override: {}", e)))?;
                Ok((feature, value))
            })
            .collect()
    }
}
