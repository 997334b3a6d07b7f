//! In-memory audit log.

use std::sync::RwLock;

use crate::error::{CadenceError, CadenceResult};
use crate::traits::{AuditEntry, AuditSink};

/// Audit log held in memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, entry: &AuditEntry) -> CadenceResult<()> {
        self.entries
            .write()
            .map_err(|e| CadenceError::internal(e.to_string()))?
            .push(entry.clone());
        Ok(())
    }

    fn for_user(&self, user_id: &str, limit: usize) -> CadenceResult<Vec<AuditEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| e.user_id() == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
