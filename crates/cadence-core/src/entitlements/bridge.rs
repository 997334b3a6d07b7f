//! Entitlement decision bridge.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{EntitlementConfig, Limit};
use crate::entitlements::{
    feature_for, next_reset, usage_day, DecisionCache, FeatureOverride, OverrideStore, UsageLedger,
};
use crate::error::{CadenceError, CadenceResult};
use crate::events::{EventBus, ProgressEvent, QuotaExhaustedEvent};
use crate::traits::{AuditEntry, AuditSink, Clock, PlanProvider};
use crate::types::{
    Actor, DecisionReason, EntitlementDecision, EntitlementLogEntry, EvaluateOptions, Feature,
    Plan, ReviewableItem, TierContext, UNLIMITED,
};

/// Review candidates after entitlement filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueFilter {
    /// Admitted items, in their original order.
    pub admitted: Vec<ReviewableItem>,
    /// The single decision made for each gated feature in the queue.
    pub decisions: BTreeMap<Feature, EntitlementDecision>,
    /// Number of gated items left out.
    pub withheld: usize,
}

impl QueueFilter {
    /// Whether any withheld item warrants an upgrade prompt.
    pub fn should_prompt_upgrade(&self) -> bool {
        self.withheld > 0 && self.decisions.values().any(|d| d.should_prompt_upgrade())
    }
}

/// Computes, caches and audits entitlement decisions.
pub struct EntitlementBridge {
    plans: Arc<dyn PlanProvider>,
    ledger: Arc<dyn UsageLedger>,
    overrides: Arc<dyn OverrideStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    cache: DecisionCache,
    events: Option<EventBus>,
    config: EntitlementConfig,
}

impl EntitlementBridge {
    pub fn new(
        plans: Arc<dyn PlanProvider>,
        ledger: Arc<dyn UsageLedger>,
        overrides: Arc<dyn OverrideStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: EntitlementConfig,
    ) -> Self {
        Self {
            plans,
            ledger,
            overrides,
            audit,
            clock,
            cache: DecisionCache::new(Duration::seconds(config.cache_ttl_secs as i64)),
            events: None,
            config,
        }
    }

    /// Emit quota events on this bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Decide whether `user_id` may use `feature`.
    ///
    /// Lookup failures deny the feature instead of erroring. Only an
    /// anonymous request is an error.
    pub async fn evaluate(
        &self,
        user_id: &str,
        feature: Feature,
        opts: &EvaluateOptions,
    ) -> CadenceResult<EntitlementDecision> {
        if user_id.trim().is_empty() {
            return Err(CadenceError::not_authenticated("no user id on the request"));
        }

        let now = self.clock.now();
        let at = opts.simulate_at.unwrap_or(now);
        let simulated = opts.is_simulated();
        if opts.skip_logging && !simulated {
            warn!(
                user_id,
                %feature,
                actor = %opts.actor,
                "skip_logging ignored for a live evaluation"
            );
        }

        let ctx = match self.plans.context(user_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(user_id, %feature, error = %e, "Plan lookup failed, denying feature");
                let decision = denied(user_id, feature, Plan::Guest, at, simulated);
                if !simulated {
                    self.log(&opts.actor, &decision, now);
                }
                return Ok(decision);
            }
        };

        if simulated {
            let decision = self.decide_or_deny(&ctx, feature, at, true);
            debug!(
                user_id,
                %feature,
                at = %at,
                allow = decision.allow,
                remaining = decision.remaining,
                "Simulated entitlement evaluation"
            );
            return Ok(decision);
        }

        let decision = match self.cache.get(user_id, feature, ctx.plan, now) {
            Some(cached) => cached,
            None => {
                let decision = self.decide(&ctx, feature, now, false);
                match decision {
                    Ok(decision) => {
                        self.cache.put(&decision, now);
                        decision
                    }
                    Err(e) => {
                        warn!(user_id, %feature, error = %e, "Entitlement lookup failed, denying feature");
                        denied(user_id, feature, ctx.plan, now, false)
                    }
                }
            }
        };

        self.log(&opts.actor, &decision, now);
        if decision.reason == DecisionReason::LimitReached {
            if let Some(events) = &self.events {
                events.emit(ProgressEvent::QuotaExhausted(QuotaExhaustedEvent::new(
                    user_id, feature, ctx.plan,
                )));
            }
        }
        Ok(decision)
    }

    fn decide_or_deny(
        &self,
        ctx: &TierContext,
        feature: Feature,
        at: DateTime<Utc>,
        simulated: bool,
    ) -> EntitlementDecision {
        self.decide(ctx, feature, at, simulated).unwrap_or_else(|e| {
            warn!(user_id = %ctx.user_id, %feature, error = %e, "Entitlement lookup failed, denying feature");
            denied(&ctx.user_id, feature, ctx.plan, at, simulated)
        })
    }

    fn decide(
        &self,
        ctx: &TierContext,
        feature: Feature,
        at: DateTime<Utc>,
        simulated: bool,
    ) -> CadenceResult<EntitlementDecision> {
        let base = EntitlementDecision {
            user_id: ctx.user_id.clone(),
            feature,
            plan: ctx.plan,
            allow: false,
            remaining: 0,
            reset_at_utc: None,
            reason: DecisionReason::NotEntitled,
            evaluated_at: at,
            simulated,
        };

        let limit = match self.overrides.get_override(&ctx.user_id, feature)? {
            Some(FeatureOverride::Grant) => {
                return Ok(EntitlementDecision {
                    allow: true,
                    remaining: UNLIMITED,
                    reason: DecisionReason::AdminOverride,
                    ..base
                })
            }
            Some(FeatureOverride::Revoke) => return Ok(base),
            Some(FeatureOverride::Limit(per_day)) => Limit::Daily(per_day),
            None => self.config.limit(ctx.plan, feature),
        };

        match limit {
            Limit::Unlimited => Ok(EntitlementDecision {
                allow: true,
                remaining: UNLIMITED,
                reason: DecisionReason::Allowed,
                ..base
            }),
            Limit::Disabled => Ok(base),
            Limit::Daily(per_day) => {
                let used = self.ledger.usage(&ctx.user_id, feature, usage_day(at))?;
                let remaining = per_day.saturating_sub(used) as i64;
                Ok(EntitlementDecision {
                    allow: remaining > 0,
                    remaining,
                    reset_at_utc: Some(next_reset(at)),
                    reason: if remaining > 0 {
                        DecisionReason::Allowed
                    } else {
                        DecisionReason::LimitReached
                    },
                    ..base
                })
            }
        }
    }

    fn log(&self, actor: &Actor, decision: &EntitlementDecision, now: DateTime<Utc>) {
        let entry = EntitlementLogEntry::new(actor.clone(), decision.clone(), now);
        if let Err(e) = self.audit.append(&AuditEntry::Entitlement(entry)) {
            error!(
                user_id = %decision.user_id,
                feature = %decision.feature,
                error = %e,
                "Failed to append entitlement decision to audit log"
            );
        }
    }

    /// Count `count` uses of `feature` today and return today's total.
    pub fn record_usage(&self, user_id: &str, feature: Feature, count: u32) -> CadenceResult<u32> {
        if user_id.trim().is_empty() {
            return Err(CadenceError::not_authenticated("no user id on the request"));
        }
        let now = self.clock.now();
        let total = self.ledger.record(user_id, feature, usage_day(now), count)?;
        self.cache.invalidate(user_id, feature);
        debug!(user_id, %feature, count, total, "Recorded feature usage");
        Ok(total)
    }

    /// Set or clear an admin override for one user and feature.
    pub fn set_override(
        &self,
        admin: &Actor,
        user_id: &str,
        feature: Feature,
        value: Option<FeatureOverride>,
    ) -> CadenceResult<()> {
        if !admin.is_admin() {
            return Err(CadenceError::invalid_input(format!(
                "{} may not change entitlement overrides",
                admin
            )));
        }
        self.overrides.set_override(user_id, feature, value)?;
        self.cache.invalidate(user_id, feature);
        info!(user_id, %feature, actor = %admin, ?value, "Entitlement override changed");
        Ok(())
    }

    /// Every override currently set for a user.
    pub fn overrides_for(&self, user_id: &str) -> CadenceResult<Vec<(Feature, FeatureOverride)>> {
        self.overrides.overrides_for(user_id)
    }

    /// Drop every cached decision for a user whose plan just changed.
    pub fn plan_changed(&self, user_id: &str) {
        self.cache.invalidate_user(user_id);
        debug!(user_id, "Dropped cached entitlement decisions after plan change");
    }

    /// Most recent audited decisions and violations for a user.
    pub fn audit_trail(&self, user_id: &str, limit: usize) -> CadenceResult<Vec<AuditEntry>> {
        self.audit.for_user(user_id, limit)
    }

    /// Keep the items of `candidates` the user may review right now.
    ///
    /// Each gated feature is evaluated once; at most `remaining` of its
    /// items are admitted, in order. Ungated content is always admitted.
    pub async fn filter_queue(
        &self,
        user_id: &str,
        candidates: Vec<ReviewableItem>,
        actor: &Actor,
    ) -> CadenceResult<QueueFilter> {
        let mut decisions = BTreeMap::new();
        let opts = EvaluateOptions {
            simulate_at: None,
            skip_logging: false,
            actor: actor.clone(),
        };
        for item in &candidates {
            if let Some(feature) = feature_for(item.content_type) {
                if !decisions.contains_key(&feature) {
                    let decision = self.evaluate(user_id, feature, &opts).await?;
                    decisions.insert(feature, decision);
                }
            }
        }

        let mut admitted_per_feature: BTreeMap<Feature, usize> = BTreeMap::new();
        let mut filter = QueueFilter::default();
        for item in candidates {
            let Some(feature) = feature_for(item.content_type) else {
                filter.admitted.push(item);
                continue;
            };
            let taken = admitted_per_feature.entry(feature).or_insert(0);
            let allowed = decisions
                .get(&feature)
                .map(|d| d.admits().map_or(true, |cap| *taken < cap))
                .unwrap_or(false);
            if allowed {
                *taken += 1;
                filter.admitted.push(item);
            } else {
                filter.withheld += 1;
            }
        }
        filter.decisions = decisions;
        Ok(filter)
    }
}

fn denied(
    user_id: &str,
    feature: Feature,
    plan: Plan,
    at: DateTime<Utc>,
    simulated: bool,
) -> EntitlementDecision {
    EntitlementDecision {
        user_id: user_id.to_string(),
        feature,
        plan,
        allow: false,
        remaining: 0,
        reset_at_utc: None,
        reason: DecisionReason::NotEntitled,
        evaluated_at: at,
        simulated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::entitlements::SqliteEntitlementStore;
    use crate::traits::{ManualClock, StaticPlanProvider};
    use crate::types::ContentType;
    use chrono::TimeZone;

    struct Fixture {
        bridge: EntitlementBridge,
        plans: Arc<StaticPlanProvider>,
        audit: Arc<MemoryAuditLog>,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 21, 12, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let plans = Arc::new(StaticPlanProvider::new(0));
        plans.set_plan("free", Plan::Free).unwrap();
        plans.set_plan("premium", Plan::Premium).unwrap();
        let store = Arc::new(SqliteEntitlementStore::in_memory().unwrap());
        let audit = Arc::new(MemoryAuditLog::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let bridge = EntitlementBridge::new(
            plans.clone(),
            store.clone(),
            store,
            audit.clone(),
            clock.clone(),
            EntitlementConfig::default(),
        );
        Fixture {
            bridge,
            plans,
            audit,
            clock,
        }
    }

    fn live(user: &str) -> EvaluateOptions {
        EvaluateOptions::for_user(user)
    }

    fn items(kinds: &[(&str, ContentType)]) -> Vec<ReviewableItem> {
        kinds
            .iter()
            .map(|(id, ct)| ReviewableItem::new("free", *id, *ct, t0()))
            .collect()
    }

    #[tokio::test]
    async fn test_free_quota_counts_down_and_resets_at_utc_midnight() {
        let f = fixture();
        let first = f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert!(first.allow);
        assert_eq!(first.remaining, 10);
        assert_eq!(first.reset_at_utc, Some(Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap()));

        f.bridge.record_usage("free", Feature::KanjiPractice, 10).unwrap();
        let exhausted = f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert!(!exhausted.allow);
        assert_eq!(exhausted.reason, DecisionReason::LimitReached);
        assert!(exhausted.should_prompt_upgrade());

        f.clock.set(Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 1).unwrap());
        let next_day = f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert_eq!(next_day.remaining, 10);
    }

    #[tokio::test]
    async fn test_premium_is_unlimited() {
        let f = fixture();
        let decision = f
            .bridge
            .evaluate("premium", Feature::CustomLists, &live("premium"))
            .await
            .unwrap();
        assert!(decision.allow);
        assert!(decision.is_unlimited());
        assert_eq!(decision.reset_at_utc, None);
    }

    #[tokio::test]
    async fn test_guest_custom_lists_disabled() {
        let f = fixture();
        let decision = f
            .bridge
            .evaluate("visitor", Feature::CustomLists, &live("visitor"))
            .await
            .unwrap();
        assert!(!decision.allow);
        assert_eq!(decision.reason, DecisionReason::NotEntitled);
        assert!(!decision.should_prompt_upgrade());
    }

    #[tokio::test]
    async fn test_live_evaluations_always_audited() {
        let f = fixture();
        let mut opts = live("free");
        opts.skip_logging = true;
        f.bridge.evaluate("free", Feature::KanjiPractice, &opts).await.unwrap();
        // Served from cache, still audited.
        f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert_eq!(f.audit.len(), 2);
    }

    #[tokio::test]
    async fn test_simulation_is_not_audited_or_cached() {
        let f = fixture();
        f.bridge.record_usage("free", Feature::KanjiPractice, 4).unwrap();

        let yesterday = t0() - Duration::days(1);
        let mut opts = EvaluateOptions::simulation("ops", yesterday);
        opts.skip_logging = false;
        let simulated = f.bridge.evaluate("free", Feature::KanjiPractice, &opts).await.unwrap();

        assert!(simulated.simulated);
        assert_eq!(simulated.remaining, 10);
        assert_eq!(simulated.evaluated_at, yesterday);
        assert!(f.audit.is_empty());

        let live_decision = f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert_eq!(live_decision.remaining, 6);
        assert!(!live_decision.simulated);
    }

    #[tokio::test]
    async fn test_overrides() {
        let f = fixture();
        let admin = Actor::Admin("ops".to_string());

        f.bridge
            .set_override(&admin, "free", Feature::KanjiPractice, Some(FeatureOverride::Grant))
            .unwrap();
        let granted = f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert_eq!(granted.reason, DecisionReason::AdminOverride);
        assert!(granted.is_unlimited());

        f.bridge
            .set_override(&admin, "premium", Feature::VocabularyReview, Some(FeatureOverride::Revoke))
            .unwrap();
        let revoked = f
            .bridge
            .evaluate("premium", Feature::VocabularyReview, &live("premium"))
            .await
            .unwrap();
        assert!(!revoked.allow);
        assert_eq!(revoked.reason, DecisionReason::NotEntitled);

        f.bridge
            .set_override(&admin, "free", Feature::VocabularyReview, Some(FeatureOverride::Limit(1)))
            .unwrap();
        let limited = f.bridge.evaluate("free", Feature::VocabularyReview, &live("free")).await.unwrap();
        assert_eq!(limited.remaining, 1);

        let user = Actor::User("free".to_string());
        assert!(f.bridge.set_override(&user, "free", Feature::KanjiPractice, None).is_err());
    }

    #[tokio::test]
    async fn test_overrides_listed_and_cache_dropped_on_plan_change() {
        let f = fixture();
        let admin = Actor::Admin("ops".to_string());
        f.bridge
            .set_override(&admin, "free", Feature::KanjiPractice, Some(FeatureOverride::Grant))
            .unwrap();
        f.bridge
            .set_override(&admin, "free", Feature::CustomLists, Some(FeatureOverride::Limit(5)))
            .unwrap();
        let listed = f.bridge.overrides_for("free").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&(Feature::KanjiPractice, FeatureOverride::Grant)));
        assert!(f.bridge.overrides_for("premium").unwrap().is_empty());

        f.bridge.evaluate("free", Feature::HiraganaPractice, &live("free")).await.unwrap();
        f.bridge.evaluate("free", Feature::KatakanaPractice, &live("free")).await.unwrap();
        f.bridge.evaluate("premium", Feature::KanjiPractice, &live("premium")).await.unwrap();
        assert_eq!(f.bridge.cache.len(), 3);

        f.bridge.plan_changed("free");
        assert_eq!(f.bridge.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_plan_change_takes_effect_despite_cache() {
        let f = fixture();
        let before = f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert_eq!(before.remaining, 10);

        f.plans.set_plan("free", Plan::Premium).unwrap();
        let after = f.bridge.evaluate("free", Feature::KanjiPractice, &live("free")).await.unwrap();
        assert!(after.is_unlimited());
    }

    #[tokio::test]
    async fn test_filter_queue_admits_up_to_remaining() {
        let f = fixture();
        f.bridge.record_usage("free", Feature::KanjiPractice, 8).unwrap();

        let queue = items(&[
            ("k1", ContentType::Kanji),
            ("s1", ContentType::Sentence),
            ("k2", ContentType::Kanji),
            ("k3", ContentType::Kanji),
            ("k4", ContentType::Kanji),
            ("g1", ContentType::Grammar),
            ("k5", ContentType::Kanji),
        ]);
        let filter = f
            .bridge
            .filter_queue("free", queue, &Actor::User("free".to_string()))
            .await
            .unwrap();

        let ids: Vec<&str> = filter.admitted.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["k1", "s1", "k2", "g1"]);
        assert_eq!(filter.withheld, 3);
        assert_eq!(filter.decisions.len(), 1);
        // Quota remains, so nothing prompts yet.
        assert!(!filter.should_prompt_upgrade());
        // One evaluation per feature.
        assert_eq!(f.audit.len(), 1);
    }

    #[tokio::test]
    async fn test_filter_queue_prompts_only_once_quota_is_spent() {
        let f = fixture();
        f.plans.set_plan("guest", Plan::Guest).unwrap();
        f.bridge.record_usage("free", Feature::KanjiPractice, 10).unwrap();
        f.bridge.record_usage("guest", Feature::KanjiPractice, 3).unwrap();
        f.bridge.record_usage("premium", Feature::KanjiPractice, 500).unwrap();

        for user in ["free", "guest"] {
            let filter = f
                .bridge
                .filter_queue(
                    user,
                    items(&[("k1", ContentType::Kanji), ("k2", ContentType::Kanji)]),
                    &Actor::User(user.to_string()),
                )
                .await
                .unwrap();
            assert!(filter.admitted.is_empty());
            assert_eq!(filter.withheld, 2);
            assert_eq!(filter.decisions[&Feature::KanjiPractice].remaining, 0);
            assert_eq!(
                filter.decisions[&Feature::KanjiPractice].reason,
                DecisionReason::LimitReached
            );
            assert!(filter.should_prompt_upgrade(), "{} should be prompted", user);
        }

        let premium = f
            .bridge
            .filter_queue(
                "premium",
                items(&[("k1", ContentType::Kanji), ("k2", ContentType::Kanji)]),
                &Actor::User("premium".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(premium.admitted.len(), 2);
        assert!(!premium.should_prompt_upgrade());
    }

    #[tokio::test]
    async fn test_anonymous_evaluation_rejected() {
        let f = fixture();
        assert!(matches!(
            f.bridge.evaluate(" ", Feature::KanjiPractice, &live("")).await,
            Err(CadenceError::NotAuthenticated { .. })
        ));
    }
}
