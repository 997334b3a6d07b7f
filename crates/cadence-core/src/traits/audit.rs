//! Audit sink trait and audit entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CadenceResult;
use crate::types::{EntitlementLogEntry, Plan};

/// A refused attempt to use a storage tier the plan does not include.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolationEntry {
    pub id: Uuid,
    pub user_id: String,
    pub plan: Plan,
    /// Store key the write targeted.
    pub key: String,
    pub operation: String,
    pub occurred_at: DateTime<Utc>,
}

impl PolicyViolationEntry {
    pub fn new(
        user_id: impl Into<String>,
        plan: Plan,
        key: impl Into<String>,
        operation: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            plan,
            key: key.into(),
            operation: operation.into(),
            occurred_at,
        }
    }
}

/// Everything the engine writes to the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Entitlement(EntitlementLogEntry),
    PolicyViolation(PolicyViolationEntry),
}

impl AuditEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entitlement(_) => "entitlement",
            Self::PolicyViolation(_) => "policy_violation",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Entitlement(e) => e.id,
            Self::PolicyViolation(e) => e.id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Entitlement(e) => &e.decision.user_id,
            Self::PolicyViolation(e) => &e.user_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Entitlement(e) => e.logged_at,
            Self::PolicyViolation(e) => e.occurred_at,
        }
    }
}

/// Append-only destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Append one entry.
    fn append(&self, entry: &AuditEntry) -> CadenceResult<()>;

    /// Most recent entries for a user, newest first.
    fn for_user(&self, user_id: &str, limit: usize) -> CadenceResult<Vec<AuditEntry>>;
}
