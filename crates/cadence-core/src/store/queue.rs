//! Write-coalescing queue for the remote tier.
//!
//! The queue tracks *which* records need pushing, not their contents: the
//! record is read from the local tier at flush time, so any number of local
//! writes to one key collapse into a single remote push.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::WriteQueueConfig;
use crate::types::TierContext;

/// How a pending record is applied to the remote tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Merge the local record into the remote one.
    Merge,
    /// Overwrite the remote record with the local one.
    Replace,
}

/// One key waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub ctx: TierContext,
    pub key: String,
    pub mode: WriteMode,
    pub first_enqueued: DateTime<Utc>,
    /// Failed push attempts so far.
    pub attempts: u32,
}

impl PendingWrite {
    fn absorb(&mut self, other: PendingWrite) {
        self.mode = self.mode.max(other.mode);
        self.first_enqueued = self.first_enqueued.min(other.first_enqueued);
        self.attempts = self.attempts.max(other.attempts);
        self.ctx = other.ctx;
    }
}

/// Pending remote writes, deduplicated per `(user, key)`.
pub struct WriteQueue {
    pending: BTreeMap<(String, String), PendingWrite>,
    max_batch: usize,
    max_delay: Duration,
}

impl WriteQueue {
    pub fn new(config: &WriteQueueConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_batch: config.max_batch.max(1),
            max_delay: Duration::seconds(config.max_delay_secs as i64),
        }
    }

    /// Mark a key dirty. Returns true when the key was not already pending.
    ///
    /// A pending `Replace` is never downgraded by a later `Merge`.
    pub fn enqueue(
        &mut self,
        ctx: &TierContext,
        key: &str,
        mode: WriteMode,
        now: DateTime<Utc>,
    ) -> bool {
        let write = PendingWrite {
            ctx: ctx.clone(),
            key: key.to_string(),
            mode,
            first_enqueued: now,
            attempts: 0,
        };
        self.insert(write)
    }

    fn insert(&mut self, write: PendingWrite) -> bool {
        let slot = (write.ctx.user_id.clone(), write.key.clone());
        match self.pending.get_mut(&slot) {
            Some(existing) => {
                existing.absorb(write);
                false
            }
            None => {
                self.pending.insert(slot, write);
                true
            }
        }
    }

    /// Put a failed write back, counting the attempt.
    pub fn requeue(&mut self, mut write: PendingWrite) {
        write.attempts += 1;
        self.insert(write);
    }

    /// Re-add a write remembered by an earlier process.
    pub fn restore(&mut self, write: PendingWrite) {
        self.insert(write);
    }

    pub fn get(&self, user_id: &str, key: &str) -> Option<&PendingWrite> {
        self.pending.get(&(user_id.to_string(), key.to_string()))
    }

    /// Take every pending write.
    pub fn drain(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn mode_of(&self, user_id: &str, key: &str) -> Option<WriteMode> {
        self.get(user_id, key).map(|w| w.mode)
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|w| w.first_enqueued).min()
    }

    /// Whether the batch is full or its oldest entry has waited long enough.
    pub fn should_flush(&self, now: DateTime<Utc>) -> bool {
        if self.pending.len() >= self.max_batch {
            return true;
        }
        self.oldest()
            .map(|oldest| now - oldest >= self.max_delay)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Plan;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 21, 9, 0, 0).unwrap()
    }

    fn queue(max_batch: usize, max_delay_secs: u64) -> WriteQueue {
        WriteQueue::new(&WriteQueueConfig {
            max_batch,
            max_delay_secs,
            ..Default::default()
        })
    }

    fn premium(user: &str) -> TierContext {
        TierContext::new(user, Plan::Premium, 0)
    }

    #[test]
    fn test_writes_to_same_key_coalesce() {
        let mut q = queue(10, 60);
        let ctx = premium("u1");
        assert!(q.enqueue(&ctx, "item:a", WriteMode::Merge, t0()));
        assert!(!q.enqueue(&ctx, "item:a", WriteMode::Merge, t0() + Duration::seconds(1)));
        assert!(q.enqueue(&ctx, "item:b", WriteMode::Merge, t0()));
        assert!(q.enqueue(&premium("u2"), "item:a", WriteMode::Merge, t0()));

        assert_eq!(q.len(), 3);
        assert_eq!(q.oldest(), Some(t0()));
    }

    #[test]
    fn test_replace_dominates_merge() {
        let mut q = queue(10, 60);
        let ctx = premium("u1");
        q.enqueue(&ctx, "streak", WriteMode::Replace, t0());
        q.enqueue(&ctx, "streak", WriteMode::Merge, t0());
        assert_eq!(q.mode_of("u1", "streak"), Some(WriteMode::Replace));
    }

    #[test]
    fn test_flush_on_batch_size() {
        let mut q = queue(2, 3600);
        let ctx = premium("u1");
        q.enqueue(&ctx, "a", WriteMode::Merge, t0());
        assert!(!q.should_flush(t0()));
        q.enqueue(&ctx, "b", WriteMode::Merge, t0());
        assert!(q.should_flush(t0()));
    }

    #[test]
    fn test_flush_on_age() {
        let mut q = queue(100, 5);
        q.enqueue(&premium("u1"), "a", WriteMode::Merge, t0());
        assert!(!q.should_flush(t0() + Duration::seconds(4)));
        assert!(q.should_flush(t0() + Duration::seconds(5)));
    }

    #[test]
    fn test_requeue_counts_attempts() {
        let mut q = queue(10, 60);
        q.enqueue(&premium("u1"), "a", WriteMode::Merge, t0());
        let mut drained = q.drain();
        assert!(q.is_empty());

        q.requeue(drained.remove(0));
        let again = q.drain();
        assert_eq!(again[0].attempts, 1);
        assert_eq!(again[0].first_enqueued, t0());
    }

    #[test]
    fn test_restored_write_keeps_its_age() {
        let mut q = queue(100, 60);
        let old = PendingWrite {
            ctx: premium("u1"),
            key: "streak".to_string(),
            mode: WriteMode::Replace,
            first_enqueued: t0(),
            attempts: 2,
        };
        q.restore(old.clone());
        q.enqueue(&premium("u1"), "streak", WriteMode::Merge, t0() + Duration::hours(1));

        // Already overdue once restored, and the rewrite is not downgraded.
        assert!(q.should_flush(t0() + Duration::hours(1)));
        assert_eq!(q.get("u1", "streak"), Some(&old));
    }
}
