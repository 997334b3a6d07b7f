//! In-process local tier.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{CadenceError, CadenceResult};
use crate::store::{PendingWrite, ProgressRecord};
use crate::traits::LocalTier;

/// Local tier kept in memory, for tests and ephemeral guest sessions.
#[derive(Default)]
pub struct MemoryLocalTier {
    records: RwLock<HashMap<String, BTreeMap<String, ProgressRecord>>>,
    pending: RwLock<BTreeMap<(String, String), PendingWrite>>,
}

impl MemoryLocalTier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalTier for MemoryLocalTier {
    fn get(&self, user_id: &str, key: &str) -> CadenceResult<Option<ProgressRecord>> {
        let records = self
            .records
            .read()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        Ok(records.get(user_id).and_then(|keys| keys.get(key)).cloned())
    }

    fn put(&self, user_id: &str, key: &str, record: &ProgressRecord) -> CadenceResult<()> {
        let mut records = self
            .records
            .write()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        records
            .entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    fn keys(&self, user_id: &str) -> CadenceResult<Vec<String>> {
        let records = self
            .records
            .read()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        Ok(records
            .get(user_id)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn mark_pending(&self, write: &PendingWrite) -> CadenceResult<()> {
        self.pending
            .write()
            .map_err(|e| CadenceError::internal(e.to_string()))?
            .insert((write.ctx.user_id.clone(), write.key.clone()), write.clone());
        Ok(())
    }

    fn clear_pending(&self, user_id: &str, key: &str) -> CadenceResult<()> {
        self.pending
            .write()
            .map_err(|e| CadenceError::internal(e.to_string()))?
            .remove(&(user_id.to_string(), key.to_string()));
        Ok(())
    }

    fn pending(&self) -> CadenceResult<Vec<PendingWrite>> {
        let pending = self
            .pending
            .read()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        Ok(pending.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProgressDelta;
    use chrono::Utc;

    #[test]
    fn test_records_are_scoped_per_user() {
        let tier = MemoryLocalTier::new();
        let mut record = ProgressRecord::new();
        record.apply(&ProgressDelta::at(Utc::now()).increment("sessions", 1), "d");

        tier.put("u1", "stats", &record).unwrap();

        assert_eq!(tier.get("u1", "stats").unwrap(), Some(record));
        assert_eq!(tier.get("u2", "stats").unwrap(), None);
        assert!(tier.keys("u2").unwrap().is_empty());
    }

    #[test]
    fn test_keys_sorted() {
        let tier = MemoryLocalTier::new();
        let record = ProgressRecord::new();
        tier.put("u1", "item:b", &record).unwrap();
        tier.put("u1", "item:a", &record).unwrap();
        tier.put("u1", "streak", &record).unwrap();
        assert_eq!(tier.keys("u1").unwrap(), vec!["item:a", "item:b", "streak"]);
    }
}
