//! The progress engine: per-user orchestration of scheduling, streaks,
//! storage and entitlements.

mod builder;
mod session;

pub use builder::EngineBuilder;
pub use session::ReviewSession;

use chrono::{Duration, NaiveDate};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::entitlements::{feature_for, EntitlementBridge, QueueFilter};
use crate::error::{CadenceError, CadenceResult};
use crate::events::{EventBus, EventSubscriber, ItemReviewedEvent, ProgressEvent, StreakUpdatedEvent};
use crate::scheduler::{classify_due, DueItems, Sm2Scheduler};
use crate::store::{MigrationReport, ProgressDelta, ProgressRecord, ReconcileReport, TieredStore};
use crate::streak::{activity_delta, flat_record, read_streak_record, StreakCalculator};
use crate::traits::{Clock, PlanProvider};
use crate::types::{
    item_key, Actor, ContentType, DecisionReason, EntitlementDecision, EvaluateOptions, Feature,
    ReviewableItem, SessionOutcome, SessionStats, StreakRisk, StreakState, TierContext,
    ITEM_KEY_PREFIX, STREAK_KEY,
};

/// Register holding the serialized [`ReviewableItem`] in an item record.
const ITEM_STATE: &str = "state";
const ITEM_REVIEWS: &str = "reviews";
const ITEM_CORRECT: &str = "correct";

/// Store key of the per-user session statistics.
pub const STATS_KEY: &str = "stats";
const SESSIONS_COMPLETED: &str = "sessions_completed";
const ITEMS_REVIEWED: &str = "items_reviewed";
const CORRECT_ANSWERS: &str = "correct_answers";
const TOTAL_RESPONSE_MS: &str = "total_response_ms";

/// Explicit service object tying the components together.
///
/// Every operation resolves the caller's [`TierContext`] through the plan
/// provider first, so plan changes take effect on the next call.
pub struct ProgressEngine {
    store: Arc<TieredStore>,
    bridge: Arc<EntitlementBridge>,
    scheduler: Sm2Scheduler,
    streaks: StreakCalculator,
    plans: Arc<dyn PlanProvider>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: EngineConfig,
}

impl ProgressEngine {
    /// Start building an engine.
    pub fn builder(config: EngineConfig, plans: Arc<dyn PlanProvider>) -> EngineBuilder {
        EngineBuilder::new(config, plans)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn bridge(&self) -> &Arc<EntitlementBridge> {
        &self.bridge
    }

    pub fn scheduler(&self) -> &Sm2Scheduler {
        &self.scheduler
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    async fn context(&self, user_id: &str) -> CadenceResult<TierContext> {
        let ctx = self.plans.context(user_id).await?;
        ctx.ensure_authenticated()?;
        Ok(ctx)
    }

    async fn load_item(&self, ctx: &TierContext, key: &str) -> CadenceResult<Option<ReviewableItem>> {
        let Some(record) = self.store.read(ctx, key).await? else {
            return Ok(None);
        };
        match record.register(ITEM_STATE) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                CadenceError::corrupted(format!("item record '{}' is unreadable: {}", key, e))
            }),
        }
    }

    // =========================================================================
    // Reviews
    // =========================================================================

    /// Apply one review outcome and persist the item's new state.
    ///
    /// Items without stored state are created as `new` first when the
    /// outcome is a first exposure, and reported as `NotFound` otherwise.
    /// Gated content is checked against the user's entitlement before the
    /// scheduler runs; a refusal is `NotEntitled` and changes nothing.
    /// Also bumps the item's review counters, the daily usage of its gated
    /// feature and today's streak activity.
    pub async fn submit_outcome(
        &self,
        user_id: &str,
        outcome: &SessionOutcome,
    ) -> CadenceResult<ReviewableItem> {
        let ctx = self.context(user_id).await?;
        let key = item_key(&outcome.item_id);
        let now = self.clock.now();

        let next = {
            let _guard = self.store.lock_key(&ctx.user_id, &key).await;
            let current = match self.load_item(&ctx, &key).await? {
                Some(item) => item,
                None if outcome.first_exposure => {
                    let content_type = outcome.content_type.ok_or_else(|| {
                        CadenceError::invalid_input(format!(
                            "first exposure of '{}' carries no content type",
                            outcome.item_id
                        ))
                    })?;
                    ReviewableItem::new(&ctx.user_id, &outcome.item_id, content_type, now)
                }
                None => return Err(CadenceError::item_not_found(&outcome.item_id)),
            };

            self.ensure_entitled(&ctx, current.content_type).await?;
            let next = self.scheduler.apply_outcome(&current, outcome, now)?;
            let delta = ProgressDelta::at(now)
                .set(ITEM_STATE, serde_json::to_value(&next)?)
                .increment(ITEM_REVIEWS, 1)
                .increment(ITEM_CORRECT, u64::from(outcome.correct));
            self.store.write(&ctx, &key, &delta)?;

            debug!(
                user_id = %ctx.user_id,
                item_id = %next.item_id,
                correct = outcome.correct,
                status = %next.status,
                interval = next.interval,
                "Applied review outcome"
            );
            self.events.emit(ProgressEvent::ItemReviewed(ItemReviewedEvent::new(
                &ctx.user_id,
                &next.item_id,
                outcome.correct,
                current.status,
                next.status,
                next.interval,
            )));
            next
        };

        if let Some(feature) = feature_for(next.content_type) {
            if let Err(e) = self.bridge.record_usage(&ctx.user_id, feature, 1) {
                warn!(user_id = %ctx.user_id, %feature, error = %e, "Failed to record feature usage");
            }
        }

        let today = ctx.local_date(now)?;
        self.mark_active(&ctx, today).await?;
        self.maybe_flush();
        Ok(next)
    }

    /// Refuse a review of gated content the user has no allowance left for.
    async fn ensure_entitled(&self, ctx: &TierContext, content_type: ContentType) -> CadenceResult<()> {
        let Some(feature) = feature_for(content_type) else {
            return Ok(());
        };
        let decision = self
            .bridge
            .evaluate(&ctx.user_id, feature, &EvaluateOptions::for_user(&ctx.user_id))
            .await?;
        if decision.allow {
            return Ok(());
        }
        debug!(user_id = %ctx.user_id, %feature, reason = ?decision.reason, "Review refused");
        Err(match decision.reason {
            DecisionReason::LimitReached => CadenceError::quota_exhausted(feature.to_string()),
            _ => CadenceError::feature_absent(feature.to_string()),
        })
    }

    /// Create the state for an item the learner is about to see.
    ///
    /// Idempotent: an item that already has state is returned unchanged.
    pub async fn introduce_item(
        &self,
        user_id: &str,
        item_id: &str,
        content_type: ContentType,
    ) -> CadenceResult<ReviewableItem> {
        if item_id.trim().is_empty() {
            return Err(CadenceError::invalid_input("item id must not be empty"));
        }
        let ctx = self.context(user_id).await?;
        let key = item_key(item_id);
        let _guard = self.store.lock_key(&ctx.user_id, &key).await;

        if let Some(existing) = self.load_item(&ctx, &key).await? {
            return Ok(existing);
        }
        let item = ReviewableItem::new(&ctx.user_id, item_id, content_type, self.clock.now());
        let delta = ProgressDelta::at(item.created_at).set(ITEM_STATE, serde_json::to_value(&item)?);
        self.store.write(&ctx, &key, &delta)?;
        debug!(user_id = %ctx.user_id, item_id, %content_type, "Introduced item");
        Ok(item)
    }

    /// Stored state of one item.
    pub async fn get_item(&self, user_id: &str, item_id: &str) -> CadenceResult<ReviewableItem> {
        let ctx = self.context(user_id).await?;
        self.load_item(&ctx, &item_key(item_id))
            .await?
            .ok_or_else(|| CadenceError::item_not_found(item_id))
    }

    /// Every item with stored state. Unreadable item records are skipped.
    pub async fn list_items(&self, user_id: &str) -> CadenceResult<Vec<ReviewableItem>> {
        let ctx = self.context(user_id).await?;
        self.items_for(&ctx).await
    }

    async fn items_for(&self, ctx: &TierContext) -> CadenceResult<Vec<ReviewableItem>> {
        let keys: Vec<String> = self
            .store
            .keys(ctx)
            .await?
            .into_iter()
            .filter(|key| key.starts_with(ITEM_KEY_PREFIX))
            .collect();
        let loaded = join_all(keys.iter().map(|key| self.load_item(ctx, key))).await;

        let mut items = Vec::with_capacity(keys.len());
        for (key, result) in keys.iter().zip(loaded) {
            match result {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!(user_id = %ctx.user_id, key = %key, error = %e, "Skipping unreadable item"),
            }
        }
        Ok(items)
    }

    /// Items due within `horizon`, bucketed in the user's calendar.
    pub async fn get_due_items(&self, user_id: &str, horizon: Duration) -> CadenceResult<DueItems> {
        let ctx = self.context(user_id).await?;
        let items = self.items_for(&ctx).await?;
        Ok(classify_due(items, self.clock.now(), ctx.offset()?, horizon))
    }

    // =========================================================================
    // Streaks
    // =========================================================================

    /// Current streak state.
    ///
    /// A stored record in a legacy or nested layout is normalized and
    /// rewritten in the flat layout.
    pub async fn get_streak(&self, user_id: &str) -> CadenceResult<StreakState> {
        let ctx = self.context(user_id).await?;
        let now = self.clock.now();
        let today = ctx.local_date(now)?;

        let _guard = self.store.lock_key(&ctx.user_id, STREAK_KEY).await;
        let record = self.store.read(&ctx, STREAK_KEY).await?;
        let stored = read_streak_record(record.as_ref());
        let state = self
            .streaks
            .compute(&stored.activity.dates, stored.prior_best, today);

        if stored.needs_rewrite() {
            self.heal_streak(&ctx, &state)?;
        }
        Ok(state)
    }

    /// Mark `date` (default: the user's today) as active.
    ///
    /// Idempotent per day. Dates after the user's today are rejected.
    pub async fn record_activity(
        &self,
        user_id: &str,
        date: Option<NaiveDate>,
    ) -> CadenceResult<StreakState> {
        let ctx = self.context(user_id).await?;
        let today = ctx.local_date(self.clock.now())?;
        let date = date.unwrap_or(today);
        if date > today {
            return Err(CadenceError::invalid_date(date.format("%Y-%m-%d").to_string()));
        }
        self.mark_active(&ctx, date).await
    }

    async fn mark_active(&self, ctx: &TierContext, date: NaiveDate) -> CadenceResult<StreakState> {
        let now = self.clock.now();
        let today = ctx.local_date(now)?;

        let _guard = self.store.lock_key(&ctx.user_id, STREAK_KEY).await;
        let record = self.store.read(ctx, STREAK_KEY).await?;
        let mut stored = read_streak_record(record.as_ref());

        if stored.activity.dates.contains(&date) && !stored.needs_rewrite() {
            return Ok(self
                .streaks
                .compute(&stored.activity.dates, stored.prior_best, today));
        }

        stored.activity.dates.insert(date);
        let state = self
            .streaks
            .compute(&stored.activity.dates, stored.prior_best, today);

        if stored.needs_rewrite() {
            self.heal_streak(ctx, &state)?;
        } else {
            self.store
                .write(ctx, STREAK_KEY, &activity_delta(Some(date), &state, now))?;
        }

        debug!(
            user_id = %ctx.user_id,
            %date,
            current_streak = state.current_streak,
            best_streak = state.best_streak,
            "Recorded activity"
        );
        self.events.emit(ProgressEvent::StreakUpdated(StreakUpdatedEvent::new(
            &ctx.user_id,
            state.current_streak,
            state.best_streak,
        )));
        Ok(state)
    }

    fn heal_streak(&self, ctx: &TierContext, state: &StreakState) -> CadenceResult<()> {
        warn!(
            user_id = %ctx.user_id,
            active_days = state.active_dates.len(),
            "Streak record was not in the flat layout, rewriting"
        );
        self.store
            .rewrite(ctx, STREAK_KEY, &flat_record(state, self.clock.now()))
    }

    /// Whether the streak breaks at the user's coming midnight.
    pub async fn streak_risk(&self, user_id: &str) -> CadenceResult<StreakRisk> {
        let ctx = self.context(user_id).await?;
        let state = self.get_streak(user_id).await?;
        let now_local = self.clock.now().with_timezone(&ctx.offset()?);
        Ok(self.streaks.streak_risk(&state, now_local))
    }

    // =========================================================================
    // Entitlements
    // =========================================================================

    pub async fn evaluate_entitlement(
        &self,
        user_id: &str,
        feature: Feature,
        opts: &EvaluateOptions,
    ) -> CadenceResult<EntitlementDecision> {
        self.bridge.evaluate(user_id, feature, opts).await
    }

    pub fn record_usage(&self, user_id: &str, feature: Feature, count: u32) -> CadenceResult<u32> {
        self.bridge.record_usage(user_id, feature, count)
    }

    /// Filter `candidates` down to what the user may review right now.
    pub async fn build_review_queue(
        &self,
        user_id: &str,
        candidates: Vec<ReviewableItem>,
    ) -> CadenceResult<QueueFilter> {
        self.bridge
            .filter_queue(user_id, candidates, &Actor::User(user_id.to_string()))
            .await
    }

    /// The entitlement-filtered queue of items due now, at most `max_items`.
    pub async fn next_review_queue(&self, user_id: &str, max_items: usize) -> CadenceResult<QueueFilter> {
        let due = self.get_due_items(user_id, Duration::zero()).await?;
        let mut filter = self.build_review_queue(user_id, due.due_now).await?;
        filter.admitted.truncate(max_items);
        Ok(filter)
    }

    /// Open a review session over the current queue.
    pub async fn start_session(&self, user_id: &str, max_items: usize) -> CadenceResult<ReviewSession<'_>> {
        let queue = self.next_review_queue(user_id, max_items).await?;
        Ok(ReviewSession::new(self, user_id, queue))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Add one finished session to the user's totals and return them.
    pub async fn complete_session(
        &self,
        user_id: &str,
        stats: &SessionStats,
    ) -> CadenceResult<SessionStats> {
        let ctx = self.context(user_id).await?;
        let _guard = self.store.lock_key(&ctx.user_id, STATS_KEY).await;
        let delta = ProgressDelta::at(self.clock.now())
            .increment(SESSIONS_COMPLETED, 1)
            .increment(ITEMS_REVIEWED, stats.items_reviewed)
            .increment(CORRECT_ANSWERS, stats.correct_answers)
            .increment(TOTAL_RESPONSE_MS, stats.total_response_ms);
        let record = self.store.write(&ctx, STATS_KEY, &delta)?;

        let totals = stats_from(&record);
        info!(
            user_id = %ctx.user_id,
            items_reviewed = stats.items_reviewed,
            sessions_completed = totals.sessions_completed,
            "Session completed"
        );
        self.maybe_flush();
        Ok(totals)
    }

    /// Lifetime session totals.
    ///
    /// Storage failures yield zeros; only an anonymous request errors.
    pub async fn get_stats(&self, user_id: &str) -> CadenceResult<SessionStats> {
        let ctx = match self.context(user_id).await {
            Ok(ctx) => ctx,
            Err(e @ CadenceError::NotAuthenticated { .. }) => return Err(e),
            Err(e) => {
                warn!(user_id, error = %e, "Plan lookup failed, reporting empty stats");
                return Ok(SessionStats::default());
            }
        };
        match self.store.read(&ctx, STATS_KEY).await {
            Ok(record) => Ok(record.as_ref().map(stats_from).unwrap_or_default()),
            Err(e) => {
                warn!(user_id = %ctx.user_id, error = %e, "Stats unavailable, reporting zeros");
                Ok(SessionStats::default())
            }
        }
    }

    // =========================================================================
    // Tiers
    // =========================================================================

    /// Copy the user's local history to the remote tier after an upgrade.
    ///
    /// Cached entitlement decisions for the user are dropped as well.
    pub async fn migrate_on_upgrade(&self, user_id: &str) -> CadenceResult<MigrationReport> {
        let ctx = self.context(user_id).await?;
        let report = self.store.migrate_on_upgrade(&ctx).await?;
        self.bridge.plan_changed(&ctx.user_id);
        Ok(report)
    }

    /// Push every pending remote write.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.store.flush().await
    }

    fn maybe_flush(&self) {
        if !self.store.flush_due() {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            store.flush().await;
        });
    }
}

fn stats_from(record: &ProgressRecord) -> SessionStats {
    SessionStats {
        sessions_completed: record.counter(SESSIONS_COMPLETED),
        items_reviewed: record.counter(ITEMS_REVIEWED),
        correct_answers: record.counter(CORRECT_ANSWERS),
        total_response_ms: record.counter(TOTAL_RESPONSE_MS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressEvent;
    use crate::traits::{ManualClock, StaticPlanProvider};
    use crate::types::{Difficulty, ItemStatus, Plan};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        engine: ProgressEngine,
        plans: Arc<StaticPlanProvider>,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 21, 9, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let plans = Arc::new(StaticPlanProvider::new(0));
        plans.set(TierContext::new("u1", Plan::Free, 0)).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let mut config = EngineConfig::builder().device_id("phone").build();
        config.write_queue.flush_in_background = false;

        let engine = ProgressEngine::builder(config, plans.clone())
            .in_memory()
            .clock(clock.clone())
            .build()
            .unwrap();
        Fixture { engine, plans, clock }
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn test_unknown_item_is_not_found() {
        let f = fixture();
        let result = f
            .engine
            .submit_outcome("u1", &SessionOutcome::correct("kanji-1", Difficulty::Good))
            .await;
        assert!(matches!(result, Err(CadenceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_first_exposure_creates_item() {
        let f = fixture();
        let outcome = SessionOutcome::correct("kanji-1", Difficulty::Good).as_first_exposure(ContentType::Kanji);
        let item = f.engine.submit_outcome("u1", &outcome).await.unwrap();
        assert_eq!(item.status, ItemStatus::Learning);
        assert_eq!(item.repetitions, 1);

        let stored = f.engine.get_item("u1", "kanji-1").await.unwrap();
        assert_eq!(stored, item);

        let streak = f.engine.get_streak("u1").await.unwrap();
        assert!(streak.is_active_today);
        assert_eq!(streak.current_streak, 1);
    }

    #[tokio::test]
    async fn test_first_exposure_without_content_type_is_rejected() {
        let f = fixture();
        let mut outcome = SessionOutcome::incorrect("kanji-1");
        outcome.first_exposure = true;
        let result = f.engine.submit_outcome("u1", &outcome).await;
        assert!(matches!(result, Err(CadenceError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_introduce_item_is_idempotent() {
        let f = fixture();
        let first = f.engine.introduce_item("u1", "kana-a", ContentType::Hiragana).await.unwrap();
        f.clock.advance(Duration::hours(1));
        let second = f.engine.introduce_item("u1", "kana-a", ContentType::Hiragana).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.engine.list_items("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_review_emits_event_and_counts_usage() {
        let f = fixture();
        let mut events = f.engine.subscribe();
        f.engine.introduce_item("u1", "kanji-1", ContentType::Kanji).await.unwrap();
        f.engine
            .submit_outcome("u1", &SessionOutcome::correct("kanji-1", Difficulty::Easy))
            .await
            .unwrap();

        match events.try_recv() {
            Some(ProgressEvent::ItemReviewed(e)) => {
                assert_eq!(e.item_id, "kanji-1");
                assert!(e.status_changed());
            }
            other => panic!("expected item reviewed event, got {:?}", other),
        }

        let decision = f
            .engine
            .evaluate_entitlement("u1", Feature::KanjiPractice, &EvaluateOptions::for_user("u1"))
            .await
            .unwrap();
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_exhausted_quota_refuses_review() {
        let f = fixture();
        f.engine.introduce_item("u1", "kanji-1", ContentType::Kanji).await.unwrap();
        f.engine.record_usage("u1", Feature::KanjiPractice, 10).unwrap();

        let result = f
            .engine
            .submit_outcome("u1", &SessionOutcome::correct("kanji-1", Difficulty::Good))
            .await;
        match result {
            Err(e @ CadenceError::NotEntitled { .. }) => {
                assert_eq!(e.code(), crate::error::ErrorCode::EntQuotaExhausted);
            }
            other => panic!("expected quota refusal, got {:?}", other),
        }

        let item = f.engine.get_item("u1", "kanji-1").await.unwrap();
        assert_eq!(item.status, ItemStatus::New);
        assert_eq!(item.repetitions, 0);
        // A refused review adds no usage.
        assert_eq!(f.engine.record_usage("u1", Feature::KanjiPractice, 0).unwrap(), 10);
        assert!(!f.engine.get_streak("u1").await.unwrap().is_active_today);

        // Ungated content is unaffected.
        f.engine.introduce_item("u1", "grammar-1", ContentType::Grammar).await.unwrap();
        f.engine
            .submit_outcome("u1", &SessionOutcome::correct("grammar-1", Difficulty::Good))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_feature_refuses_first_exposure() {
        let f = fixture();
        f.plans.set_plan("u1", Plan::Guest).unwrap();
        let outcome = SessionOutcome::correct("list-1", Difficulty::Good)
            .as_first_exposure(ContentType::CustomList);

        let result = f.engine.submit_outcome("u1", &outcome).await;
        match result {
            Err(e @ CadenceError::NotEntitled { .. }) => {
                assert_eq!(e.code(), crate::error::ErrorCode::EntFeatureAbsent);
            }
            other => panic!("expected feature refusal, got {:?}", other),
        }
        assert!(matches!(
            f.engine.get_item("u1", "list-1").await,
            Err(CadenceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_due_items_use_stored_schedule() {
        let f = fixture();
        f.engine.introduce_item("u1", "a", ContentType::Vocabulary).await.unwrap();
        f.engine.introduce_item("u1", "b", ContentType::Vocabulary).await.unwrap();
        f.engine
            .submit_outcome("u1", &SessionOutcome::correct("b", Difficulty::Good))
            .await
            .unwrap();

        let due = f.engine.get_due_items("u1", Duration::days(7)).await.unwrap();
        assert_eq!(due.due_now.len(), 1);
        assert_eq!(due.due_now[0].item_id, "a");
        assert_eq!(due.due_tomorrow.len(), 1);
    }

    #[tokio::test]
    async fn test_record_activity_is_idempotent_and_rejects_future() {
        let f = fixture();
        let first = f.engine.record_activity("u1", None).await.unwrap();
        let again = f.engine.record_activity("u1", None).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(again.current_streak, 1);

        let future = f.engine.record_activity("u1", Some(d("2024-01-22"))).await;
        assert!(matches!(future, Err(CadenceError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_grace_window_keeps_streak() {
        let f = fixture();
        for day in ["2024-01-18", "2024-01-19", "2024-01-20"] {
            f.engine.record_activity("u1", Some(d(day))).await.unwrap();
        }
        let state = f.engine.get_streak("u1").await.unwrap();
        assert_eq!(state.current_streak, 3);
        assert!(!state.is_active_today);
        assert_eq!(state.best_streak, 3);
    }

    #[tokio::test]
    async fn test_nested_streak_record_is_healed() {
        let f = fixture();
        let ctx = TierContext::new("u1", Plan::Free, 0);
        let nested = ProgressDelta::at(t0())
            .set("dates", json!({ "2024-01-20": true, "2024-01-21": { "reviews": 3 } }))
            .set("2024-01-19", true);
        f.engine.store().write(&ctx, STREAK_KEY, &nested).unwrap();

        let state = f.engine.get_streak("u1").await.unwrap();
        assert_eq!(state.current_streak, 3);

        let record = f.engine.store().read(&ctx, STREAK_KEY).await.unwrap().unwrap();
        assert_eq!(record.register("dates"), None);
        assert_eq!(record.register("2024-01-21"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_streak_risk_late_in_the_day() {
        let f = fixture();
        f.engine.record_activity("u1", Some(d("2024-01-20"))).await.unwrap();
        f.clock.set(Utc.with_ymd_and_hms(2024, 1, 21, 22, 0, 0).unwrap());

        let risk = f.engine.streak_risk("u1").await.unwrap();
        assert!(risk.at_risk);
        assert!((risk.hours_remaining - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stats_accumulate_across_sessions() {
        let f = fixture();
        let mut stats = SessionStats::default();
        stats.record(&SessionOutcome::correct("a", Difficulty::Good).with_response_time(900));
        stats.record(&SessionOutcome::incorrect("b").with_response_time(1100));

        f.engine.complete_session("u1", &stats).await.unwrap();
        let totals = f.engine.complete_session("u1", &stats).await.unwrap();
        assert_eq!(totals.sessions_completed, 2);
        assert_eq!(totals.items_reviewed, 4);
        assert_eq!(totals.correct_answers, 2);
        assert_eq!(f.engine.get_stats("u1").await.unwrap(), totals);
    }

    #[tokio::test]
    async fn test_stats_for_new_user_are_zero() {
        let f = fixture();
        assert_eq!(f.engine.get_stats("u2").await.unwrap(), SessionStats::default());
        assert!(f.engine.get_stats("").await.is_err());
    }

    #[tokio::test]
    async fn test_free_user_queue_is_capped_by_quota() {
        let f = fixture();
        for i in 0..12 {
            f.engine
                .introduce_item("u1", &format!("kanji-{:02}", i), ContentType::Kanji)
                .await
                .unwrap();
        }
        f.engine.introduce_item("u1", "grammar-1", ContentType::Grammar).await.unwrap();
        f.engine.record_usage("u1", Feature::KanjiPractice, 8).unwrap();

        let queue = f.engine.next_review_queue("u1", 50).await.unwrap();
        let kanji = queue
            .admitted
            .iter()
            .filter(|i| i.content_type == ContentType::Kanji)
            .count();
        assert_eq!(kanji, 2);
        assert_eq!(queue.admitted.len(), 3);
        assert_eq!(queue.withheld, 10);
    }

    #[tokio::test]
    async fn test_premium_writes_reach_remote_after_reconcile() {
        let f = fixture();
        f.plans.set_plan("u1", Plan::Premium).unwrap();
        f.engine.introduce_item("u1", "kanji-1", ContentType::Kanji).await.unwrap();
        assert_eq!(f.engine.store().pending_writes(), 1);

        let report = f.engine.reconcile().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(report.pending, 0);
    }
}
