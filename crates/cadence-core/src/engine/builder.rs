//! Engine construction.

use std::sync::Arc;
use tracing::debug;

use crate::audit::SqliteAuditLog;
use crate::config::EngineConfig;
use crate::engine::ProgressEngine;
use crate::entitlements::{EntitlementBridge, OverrideStore, SqliteEntitlementStore, UsageLedger};
use crate::error::CadenceResult;
use crate::events::EventBus;
use crate::scheduler::Sm2Scheduler;
use crate::store::{MemoryLocalTier, SqliteProgressStore, TieredStore};
use crate::streak::StreakCalculator;
use crate::traits::{AuditSink, Clock, LocalTier, PlanProvider, RemoteTier, SystemClock};

/// Assembles a [`ProgressEngine`] from its collaborators.
///
/// Anything not supplied is created from the config: SQLite databases at
/// the configured paths (the local tier stays in memory without one) and
/// the system clock.
pub struct EngineBuilder {
    config: EngineConfig,
    plans: Arc<dyn PlanProvider>,
    local: Option<Arc<dyn LocalTier>>,
    remote: Option<Arc<dyn RemoteTier>>,
    audit: Option<Arc<dyn AuditSink>>,
    ledger: Option<Arc<dyn UsageLedger>>,
    overrides: Option<Arc<dyn OverrideStore>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventBus>,
    in_memory: bool,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, plans: Arc<dyn PlanProvider>) -> Self {
        Self {
            config,
            plans,
            local: None,
            remote: None,
            audit: None,
            ledger: None,
            overrides: None,
            clock: None,
            events: None,
            in_memory: false,
        }
    }

    /// Keep every default database in memory.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn local_tier(mut self, local: Arc<dyn LocalTier>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn remote_tier(mut self, remote: Arc<dyn RemoteTier>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Use one store for both the usage ledger and overrides.
    pub fn entitlement_store(mut self, store: Arc<SqliteEntitlementStore>) -> Self {
        self.ledger = Some(store.clone());
        self.overrides = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> CadenceResult<ProgressEngine> {
        self.config.validate()?;
        let config = self.config;
        let in_memory = self.in_memory;

        let local: Arc<dyn LocalTier> = match (self.local, &config.local_db_path) {
            (Some(local), _) => local,
            (None, Some(path)) if !in_memory => {
                debug!(path = %path.display(), "Opening file-backed local tier");
                Arc::new(SqliteProgressStore::new(path)?)
            }
            (None, _) => Arc::new(MemoryLocalTier::new()),
        };

        let remote: Arc<dyn RemoteTier> = match (self.remote, &config.remote_db_path) {
            (Some(remote), _) => remote,
            (None, Some(path)) if !in_memory => {
                debug!(path = %path.display(), "Opening file-backed remote tier");
                Arc::new(SqliteProgressStore::new(path)?)
            }
            (None, _) => {
                debug!("Creating in-memory remote tier");
                Arc::new(SqliteProgressStore::in_memory()?)
            }
        };

        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None if in_memory => Arc::new(SqliteAuditLog::in_memory()?),
            None => Arc::new(SqliteAuditLog::new(&config.audit_db_path)?),
        };

        let (ledger, overrides): (Arc<dyn UsageLedger>, Arc<dyn OverrideStore>) =
            match (self.ledger, self.overrides) {
                (Some(ledger), Some(overrides)) => (ledger, overrides),
                _ => {
                    let store = if in_memory {
                        Arc::new(SqliteEntitlementStore::in_memory()?)
                    } else {
                        Arc::new(SqliteEntitlementStore::new(&config.entitlement_db_path)?)
                    };
                    (store.clone(), store)
                }
            };

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();

        let store = TieredStore::new(
            local,
            remote,
            clock.clone(),
            config.device_id.clone(),
            config.write_queue.clone(),
        )
        .with_audit(audit.clone())
        .with_events(events.clone());

        let bridge = EntitlementBridge::new(
            self.plans.clone(),
            ledger,
            overrides,
            audit,
            clock.clone(),
            config.entitlements.clone(),
        )
        .with_events(events.clone());

        Ok(ProgressEngine {
            store: Arc::new(store),
            bridge: Arc::new(bridge),
            scheduler: Sm2Scheduler::new(config.scheduler.clone()),
            streaks: StreakCalculator::new(config.streak.clone()),
            plans: self.plans,
            clock,
            events,
            config,
        })
    }
}
