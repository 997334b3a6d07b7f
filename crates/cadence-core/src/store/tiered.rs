//! Two-tier progress store.

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::WriteQueueConfig;
use crate::error::{CadenceError, CadenceResult};
use crate::events::{EventBus, MigrationCompletedEvent, PolicyViolationEvent, ProgressEvent};
use crate::store::{KeyLocks, PendingWrite, ProgressDelta, ProgressRecord, WriteMode, WriteQueue};
use crate::traits::{AuditEntry, AuditSink, Clock, LocalTier, PolicyViolationEntry, RemoteTier};
use crate::types::TierContext;

/// Outcome of one flush of the write queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Records merged into the remote tier.
    pub pushed: usize,
    /// Records that failed and were queued again.
    pub failed: usize,
    /// Entries dropped because the local record no longer exists.
    pub skipped: usize,
    /// Entries still pending after the flush.
    pub pending: usize,
}

/// Outcome of copying local history to the remote tier after an upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub user_id: String,
    pub migrated_keys: usize,
    /// True when an earlier migration had already run; nothing was copied.
    pub already_migrated: bool,
    pub migrated_at: DateTime<Utc>,
}

/// Local-first store with an optional durable remote tier.
///
/// - Every write is applied to the local tier synchronously.
/// - Premium writes are also queued for the remote tier and pushed in
///   coalesced batches. Remote failures never fail the user's write.
/// - Premium reads merge both tiers; an unreachable remote tier degrades
///   to local-only reads.
/// - Any remote write for a non-premium context is refused, logged and
///   audited.
pub struct TieredStore {
    local: Arc<dyn LocalTier>,
    remote: Arc<dyn RemoteTier>,
    clock: Arc<dyn Clock>,
    queue: Mutex<WriteQueue>,
    local_writes: Mutex<()>,
    locks: KeyLocks,
    audit: Option<Arc<dyn AuditSink>>,
    events: Option<EventBus>,
    device_id: String,
    config: WriteQueueConfig,
}

impl TieredStore {
    pub fn new(
        local: Arc<dyn LocalTier>,
        remote: Arc<dyn RemoteTier>,
        clock: Arc<dyn Clock>,
        device_id: impl Into<String>,
        config: WriteQueueConfig,
    ) -> Self {
        let mut queue = WriteQueue::new(&config);
        match local.pending() {
            Ok(remembered) => {
                if !remembered.is_empty() {
                    info!(count = remembered.len(), "Restored pending remote writes");
                }
                for write in remembered {
                    queue.restore(write);
                }
            }
            Err(e) => warn!(error = %e, "Could not restore pending remote writes"),
        }

        Self {
            local,
            remote,
            clock,
            queue: Mutex::new(queue),
            local_writes: Mutex::new(()),
            locks: KeyLocks::new(),
            audit: None,
            events: None,
            device_id: device_id.into(),
            config,
        }
    }

    /// Record policy violations in this audit sink.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Emit store events on this bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Exclusive access to `(user_id, key)` for a read-modify-write cycle.
    pub async fn lock_key(&self, user_id: &str, key: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(user_id, key).await
    }

    fn queue(&self) -> MutexGuard<'_, WriteQueue> {
        match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn local_guard(&self) -> MutexGuard<'_, ()> {
        match self.local_writes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Read the current record for `key`.
    pub async fn read(&self, ctx: &TierContext, key: &str) -> CadenceResult<Option<ProgressRecord>> {
        ctx.ensure_authenticated()?;
        let local = self.local.get(&ctx.user_id, key)?;
        if !ctx.plan.uses_remote_tier() {
            return Ok(local);
        }

        // Until a rewrite reaches the remote tier, the local copy is authoritative.
        if self.queue().mode_of(&ctx.user_id, key) == Some(WriteMode::Replace) {
            return Ok(local);
        }

        let remote = match self.remote.get(&ctx.user_id, key).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    user_id = %ctx.user_id,
                    key,
                    error = %e,
                    "Remote tier unavailable, serving local record"
                );
                return Ok(local);
            }
        };

        let Some(remote) = remote else {
            return Ok(local);
        };
        if local.as_ref() == Some(&remote) {
            return Ok(local);
        }

        // Fold remote state into the local copy so later offline reads see it.
        let _guard = self.local_guard();
        let mut merged = self.local.get(&ctx.user_id, key)?.unwrap_or_default();
        merged.merge_from(&remote);
        self.local.put(&ctx.user_id, key, &merged)?;
        debug!(user_id = %ctx.user_id, key, "Merged remote record into local tier");
        Ok(Some(merged))
    }

    /// Apply `delta` to `key` and return the resulting local record.
    ///
    /// Completes once the local tier has the write. For premium contexts
    /// the key is also queued for the remote tier.
    pub fn write(
        &self,
        ctx: &TierContext,
        key: &str,
        delta: &ProgressDelta,
    ) -> CadenceResult<ProgressRecord> {
        ctx.ensure_authenticated()?;
        let record = {
            let _guard = self.local_guard();
            let mut record = self.local.get(&ctx.user_id, key)?.unwrap_or_default();
            record.apply(delta, &self.device_id);
            self.local.put(&ctx.user_id, key, &record)?;
            record
        };

        if ctx.plan.uses_remote_tier() {
            self.enqueue(ctx, key, WriteMode::Merge);
        }
        Ok(record)
    }

    /// Replace the whole record for `key`.
    ///
    /// Used to repair records that fail validation. The remote copy is
    /// overwritten on the next flush instead of merged.
    pub fn rewrite(
        &self,
        ctx: &TierContext,
        key: &str,
        record: &ProgressRecord,
    ) -> CadenceResult<()> {
        ctx.ensure_authenticated()?;
        {
            let _guard = self.local_guard();
            self.local.put(&ctx.user_id, key, record)?;
        }
        if ctx.plan.uses_remote_tier() {
            self.enqueue(ctx, key, WriteMode::Replace);
        }
        Ok(())
    }

    /// Queue `key` for the remote tier and remember it in the local tier, so
    /// a restart does not lose it.
    fn enqueue(&self, ctx: &TierContext, key: &str, mode: WriteMode) {
        let mut queue = self.queue();
        queue.enqueue(ctx, key, mode, self.clock.now());
        self.remember(&queue, &ctx.user_id, key);
    }

    fn remember(&self, queue: &WriteQueue, user_id: &str, key: &str) {
        let Some(write) = queue.get(user_id, key) else {
            return;
        };
        if let Err(e) = self.local.mark_pending(write) {
            warn!(user_id, key, error = %e, "Failed to persist pending remote write");
        }
    }

    /// Forget a finished write unless the key was queued again meanwhile.
    fn settle(&self, write: &PendingWrite) {
        let queue = self.queue();
        if queue.get(&write.ctx.user_id, &write.key).is_some() {
            return;
        }
        if let Err(e) = self.local.clear_pending(&write.ctx.user_id, &write.key) {
            warn!(
                user_id = %write.ctx.user_id,
                key = %write.key,
                error = %e,
                "Failed to clear pending remote write"
            );
        }
    }

    /// All keys known for the user, across both tiers for premium.
    pub async fn keys(&self, ctx: &TierContext) -> CadenceResult<Vec<String>> {
        ctx.ensure_authenticated()?;
        let mut keys: BTreeSet<String> = self.local.keys(&ctx.user_id)?.into_iter().collect();
        if ctx.plan.uses_remote_tier() {
            match self.remote.keys(&ctx.user_id).await {
                Ok(remote) => keys.extend(remote),
                Err(e) => warn!(
                    user_id = %ctx.user_id,
                    error = %e,
                    "Remote tier unavailable, listing local keys only"
                ),
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Write `record` straight to the remote tier, merging with what is there.
    ///
    /// Refused with [`CadenceError::PolicyViolation`] for non-premium plans.
    pub async fn write_remote(
        &self,
        ctx: &TierContext,
        key: &str,
        record: &ProgressRecord,
    ) -> CadenceResult<()> {
        ctx.ensure_authenticated()?;
        self.ensure_remote_allowed(ctx, key, "write_remote")?;
        self.push_merged(&ctx.user_id, key, record).await
    }

    fn ensure_remote_allowed(
        &self,
        ctx: &TierContext,
        key: &str,
        operation: &str,
    ) -> CadenceResult<()> {
        if ctx.plan.uses_remote_tier() {
            return Ok(());
        }

        warn!(
            user_id = %ctx.user_id,
            plan = %ctx.plan,
            key,
            operation,
            "Rejected remote tier write for non-premium plan"
        );
        if let Some(audit) = &self.audit {
            let entry = PolicyViolationEntry::new(
                &ctx.user_id,
                ctx.plan,
                key,
                operation,
                self.clock.now(),
            );
            if let Err(e) = audit.append(&AuditEntry::PolicyViolation(entry)) {
                warn!(user_id = %ctx.user_id, error = %e, "Failed to audit policy violation");
            }
        }
        if let Some(events) = &self.events {
            events.emit(ProgressEvent::PolicyViolation(PolicyViolationEvent::new(
                &ctx.user_id,
                ctx.plan,
                key,
            )));
        }

        Err(CadenceError::policy_violation(
            &ctx.user_id,
            format!("{} plan cannot write {} to the remote tier", ctx.plan, key),
        ))
    }

    async fn retrying<T, F, Fut>(&self, op: F) -> CadenceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CadenceResult<T>>,
    {
        let policy = &self.config.retry;
        op.retry(
            ExponentialBuilder::default()
                .with_max_times(policy.max_retries as usize)
                .with_min_delay(Duration::from_millis(policy.initial_delay_ms))
                .with_max_delay(Duration::from_millis(policy.max_delay_ms))
                .with_factor(policy.multiplier),
        )
        .when(|e: &CadenceError| e.is_transient())
        .notify(|err, dur| {
            debug!(error = %err, "Remote tier call failed, retrying in {:?}", dur);
        })
        .await
    }

    async fn push_merged(
        &self,
        user_id: &str,
        key: &str,
        record: &ProgressRecord,
    ) -> CadenceResult<()> {
        self.retrying(|| async {
            let existing = self.remote.get(user_id, key).await?;
            let merged = ProgressRecord::merged(Some(record), existing.as_ref()).unwrap_or_default();
            self.remote.put(user_id, key, &merged).await
        })
        .await
    }

    async fn push(&self, write: &PendingWrite) -> CadenceResult<bool> {
        self.ensure_remote_allowed(&write.ctx, &write.key, "flush")?;
        let user_id = write.ctx.user_id.as_str();
        let Some(record) = self.local.get(user_id, &write.key)? else {
            return Ok(false);
        };

        match write.mode {
            WriteMode::Merge => self.push_merged(user_id, &write.key, &record).await?,
            WriteMode::Replace => {
                self.retrying(|| self.remote.put(user_id, &write.key, &record))
                    .await?
            }
        }
        Ok(true)
    }

    /// Whether the write queue wants a background flush now.
    pub fn flush_due(&self) -> bool {
        self.config.flush_in_background && self.queue().should_flush(self.clock.now())
    }

    pub fn pending_writes(&self) -> usize {
        self.queue().len()
    }

    /// Push every pending write to the remote tier.
    ///
    /// Failed pushes are queued again; local data is never touched. Writes
    /// left pending by an earlier process are included.
    pub async fn flush(&self) -> ReconcileReport {
        let batch = self.queue().drain();
        if batch.is_empty() {
            return ReconcileReport::default();
        }
        debug!(count = batch.len(), "Flushing remote write queue");

        let mut report = ReconcileReport::default();
        for write in batch {
            match self.push(&write).await {
                Ok(true) => {
                    report.pushed += 1;
                    self.settle(&write);
                }
                Ok(false) | Err(CadenceError::PolicyViolation { .. }) => {
                    report.skipped += 1;
                    self.settle(&write);
                }
                Err(e) => {
                    warn!(
                        user_id = %write.ctx.user_id,
                        key = %write.key,
                        attempts = write.attempts + 1,
                        error = %e,
                        "Remote push failed, keeping write queued"
                    );
                    report.failed += 1;
                    let mut queue = self.queue();
                    let (user_id, key) = (write.ctx.user_id.clone(), write.key.clone());
                    queue.requeue(write);
                    self.remember(&queue, &user_id, &key);
                }
            }
        }
        report.pending = self.pending_writes();

        info!(
            pushed = report.pushed,
            failed = report.failed,
            pending = report.pending,
            "Remote write queue flushed"
        );
        report
    }

    /// Copy the user's local history to the remote tier once, after an upgrade.
    ///
    /// Local records are merged into whatever the remote tier already holds
    /// and are left in place. A remote marker makes repeated calls no-ops.
    pub async fn migrate_on_upgrade(&self, ctx: &TierContext) -> CadenceResult<MigrationReport> {
        ctx.ensure_authenticated()?;
        self.ensure_remote_allowed(ctx, "*", "migrate")?;

        if let Some(migrated_at) = self
            .retrying(|| self.remote.migration_marker(&ctx.user_id))
            .await?
        {
            debug!(user_id = %ctx.user_id, %migrated_at, "Local history already migrated");
            return Ok(MigrationReport {
                user_id: ctx.user_id.clone(),
                migrated_keys: 0,
                already_migrated: true,
                migrated_at,
            });
        }

        let mut migrated_keys = 0;
        for key in self.local.keys(&ctx.user_id)? {
            let Some(record) = self.local.get(&ctx.user_id, &key)? else {
                continue;
            };
            self.push_merged(&ctx.user_id, &key, &record).await?;
            migrated_keys += 1;
        }

        let migrated_at = self.clock.now();
        self.retrying(|| self.remote.set_migration_marker(&ctx.user_id, migrated_at))
            .await?;

        info!(user_id = %ctx.user_id, migrated_keys, "Migrated local history to remote tier");
        if let Some(events) = &self.events {
            events.emit(ProgressEvent::MigrationCompleted(MigrationCompletedEvent::new(
                &ctx.user_id,
                migrated_keys,
            )));
        }

        Ok(MigrationReport {
            user_id: ctx.user_id.clone(),
            migrated_keys,
            already_migrated: false,
            migrated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::store::{MemoryLocalTier, SqliteProgressStore};
    use crate::traits::ManualClock;
    use crate::types::Plan;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        store: TieredStore,
        local: Arc<MemoryLocalTier>,
        remote: Arc<SqliteProgressStore>,
        audit: Arc<MemoryAuditLog>,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 21, 9, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let local = Arc::new(MemoryLocalTier::new());
        let remote = Arc::new(SqliteProgressStore::in_memory().unwrap());
        let audit = Arc::new(MemoryAuditLog::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let config = WriteQueueConfig {
            max_batch: 3,
            max_delay_secs: 5,
            ..Default::default()
        };
        let store = TieredStore::new(local.clone(), remote.clone(), clock.clone(), "phone", config)
            .with_audit(audit.clone());
        Fixture {
            store,
            local,
            remote,
            audit,
            clock,
        }
    }

    fn ctx(plan: Plan) -> TierContext {
        TierContext::new("u1", plan, 0)
    }

    #[tokio::test]
    async fn test_free_write_stays_local() {
        let f = fixture();
        let free = ctx(Plan::Free);

        f.store
            .write(&free, "stats", &ProgressDelta::at(t0()).increment("sessions", 1))
            .unwrap();

        assert_eq!(f.store.pending_writes(), 0);
        assert_eq!(f.store.flush().await, ReconcileReport::default());
        assert_eq!(RemoteTier::get(f.remote.as_ref(), "u1", "stats").await.unwrap(), None);
        assert_eq!(
            f.store.read(&free, "stats").await.unwrap().unwrap().counter("sessions"),
            1
        );
    }

    #[tokio::test]
    async fn test_free_remote_write_rejected_and_audited() {
        let f = fixture();
        let free = ctx(Plan::Free);
        let record = f
            .store
            .write(&free, "stats", &ProgressDelta::at(t0()).increment("sessions", 1))
            .unwrap();

        let err = f.store.write_remote(&free, "stats", &record).await.unwrap_err();
        assert!(matches!(err, CadenceError::PolicyViolation { .. }));

        // The local write is unaffected.
        assert!(f.local.get("u1", "stats").unwrap().is_some());
        let entries = f.audit.for_user("u1", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind(), "policy_violation");
    }

    #[tokio::test]
    async fn test_premium_writes_coalesce_into_one_push() {
        let f = fixture();
        let premium = ctx(Plan::Premium);
        for _ in 0..5 {
            f.store
                .write(&premium, "stats", &ProgressDelta::at(t0()).increment("reviews", 1))
                .unwrap();
        }
        assert_eq!(f.store.pending_writes(), 1);
        assert!(!f.store.flush_due());

        f.clock.advance(chrono::Duration::seconds(5));
        assert!(f.store.flush_due());

        let report = f.store.flush().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(report.pending, 0);

        let remote = RemoteTier::get(f.remote.as_ref(), "u1", "stats").await.unwrap().unwrap();
        assert_eq!(remote.counter("reviews"), 5);
    }

    #[tokio::test]
    async fn test_premium_read_merges_remote_progress() {
        let f = fixture();
        let premium = ctx(Plan::Premium);

        let mut laptop = ProgressRecord::new();
        laptop.apply(&ProgressDelta::at(t0()).increment("sessions", 2), "laptop");
        RemoteTier::put(f.remote.as_ref(), "u1", "stats", &laptop).await.unwrap();

        f.store
            .write(&premium, "stats", &ProgressDelta::at(t0()).increment("sessions", 1))
            .unwrap();

        let merged = f.store.read(&premium, "stats").await.unwrap().unwrap();
        assert_eq!(merged.counter("sessions"), 3);

        // Pushing twice never double counts.
        f.store.flush().await;
        f.store.write_remote(&premium, "stats", &merged).await.unwrap();
        let remote = RemoteTier::get(f.remote.as_ref(), "u1", "stats").await.unwrap().unwrap();
        assert_eq!(remote.counter("sessions"), 3);
    }

    #[tokio::test]
    async fn test_rewrite_overwrites_remote() {
        let f = fixture();
        let premium = ctx(Plan::Premium);

        let mut junk = ProgressRecord::new();
        junk.apply(&ProgressDelta::at(t0()).set("garbage", true), "laptop");
        RemoteTier::put(f.remote.as_ref(), "u1", "streak", &junk).await.unwrap();

        let mut clean = ProgressRecord::new();
        clean.apply(&ProgressDelta::at(t0()).set("2024-01-21", true), "phone");
        f.store.rewrite(&premium, "streak", &clean).unwrap();

        // The pending rewrite shields the local copy from the stale remote one.
        let read = f.store.read(&premium, "streak").await.unwrap().unwrap();
        assert_eq!(read.register("garbage"), None);

        f.store.flush().await;
        let remote = RemoteTier::get(f.remote.as_ref(), "u1", "streak").await.unwrap().unwrap();
        assert_eq!(remote.register("garbage"), None);
        assert_eq!(remote.register("2024-01-21"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_migration_runs_once_and_keeps_local() {
        let f = fixture();
        let free = ctx(Plan::Free);
        f.store
            .write(&free, "item:a", &ProgressDelta::at(t0()).set("status", "review"))
            .unwrap();
        f.store
            .write(&free, "stats", &ProgressDelta::at(t0()).increment("sessions", 4))
            .unwrap();

        let denied = f.store.migrate_on_upgrade(&free).await;
        assert!(matches!(denied, Err(CadenceError::PolicyViolation { .. })));

        let premium = ctx(Plan::Premium);
        let report = f.store.migrate_on_upgrade(&premium).await.unwrap();
        assert_eq!(report.migrated_keys, 2);
        assert!(!report.already_migrated);

        let again = f.store.migrate_on_upgrade(&premium).await.unwrap();
        assert!(again.already_migrated);
        assert_eq!(again.migrated_keys, 0);

        assert_eq!(f.local.keys("u1").unwrap().len(), 2);
        let remote = RemoteTier::get(f.remote.as_ref(), "u1", "stats").await.unwrap().unwrap();
        assert_eq!(remote.counter("sessions"), 4);
    }

    #[tokio::test]
    async fn test_keys_union_for_premium() {
        let f = fixture();
        RemoteTier::put(f.remote.as_ref(), "u1", "item:remote", &ProgressRecord::new())
            .await
            .unwrap();
        f.store
            .write(&ctx(Plan::Premium), "item:local", &ProgressDelta::at(t0()).set("x", 1))
            .unwrap();

        assert_eq!(
            f.store.keys(&ctx(Plan::Premium)).await.unwrap(),
            vec!["item:local", "item:remote"]
        );
        assert_eq!(f.store.keys(&ctx(Plan::Free)).await.unwrap(), vec!["item:local"]);
    }

    #[tokio::test]
    async fn test_anonymous_write_rejected() {
        let f = fixture();
        let anon = TierContext::new("", Plan::Guest, 0);
        let result = f.store.write(&anon, "stats", &ProgressDelta::at(t0()).increment("x", 1));
        assert!(matches!(result, Err(CadenceError::NotAuthenticated { .. })));
    }
}
