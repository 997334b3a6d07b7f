//! Bounded cache of live entitlement decisions.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::types::{EntitlementDecision, Feature, Plan};

struct Cached {
    decision: EntitlementDecision,
    valid_until: DateTime<Utc>,
}

/// Decisions keyed by `(user, feature)`.
///
/// An entry expires after the TTL or at the decision's quota reset,
/// whichever comes first, and is ignored once the user's plan changes.
pub struct DecisionCache {
    entries: Mutex<HashMap<(String, Feature), Cached>>,
    ttl: Duration,
}

impl DecisionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(String, Feature), Cached>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(
        &self,
        user_id: &str,
        feature: Feature,
        plan: Plan,
        now: DateTime<Utc>,
    ) -> Option<EntitlementDecision> {
        let mut entries = self.entries();
        let key = (user_id.to_string(), feature);
        match entries.get(&key) {
            Some(cached) if cached.valid_until > now && cached.decision.plan == plan => {
                Some(cached.decision.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, decision: &EntitlementDecision, now: DateTime<Utc>) {
        let mut valid_until = now + self.ttl;
        if let Some(reset) = decision.reset_at_utc {
            valid_until = valid_until.min(reset);
        }
        if valid_until <= now {
            return;
        }
        self.entries().insert(
            (decision.user_id.clone(), decision.feature),
            Cached {
                decision: decision.clone(),
                valid_until,
            },
        );
    }

    pub fn invalidate(&self, user_id: &str, feature: Feature) {
        self.entries().remove(&(user_id.to_string(), feature));
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.entries().retain(|(user, _), _| user != user_id);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecisionReason;
    use chrono::TimeZone;

    fn decision(reset: Option<DateTime<Utc>>) -> EntitlementDecision {
        EntitlementDecision {
            user_id: "u1".to_string(),
            feature: Feature::KanjiPractice,
            plan: Plan::Free,
            allow: true,
            remaining: 5,
            reset_at_utc: reset,
            reason: DecisionReason::Allowed,
            evaluated_at: now(),
            simulated: false,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 21, 23, 58, 0).unwrap()
    }

    #[test]
    fn test_entry_expires_at_reset_before_ttl() {
        let cache = DecisionCache::new(Duration::minutes(5));
        let reset = Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap();
        cache.put(&decision(Some(reset)), now());

        assert!(cache
            .get("u1", Feature::KanjiPractice, Plan::Free, now() + Duration::minutes(1))
            .is_some());
        assert!(cache
            .get("u1", Feature::KanjiPractice, Plan::Free, reset)
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = DecisionCache::new(Duration::seconds(30));
        cache.put(&decision(None), now());
        assert!(cache
            .get("u1", Feature::KanjiPractice, Plan::Free, now() + Duration::seconds(31))
            .is_none());
    }

    #[test]
    fn test_plan_change_bypasses_entry() {
        let cache = DecisionCache::new(Duration::minutes(5));
        cache.put(&decision(None), now());
        assert!(cache
            .get("u1", Feature::KanjiPractice, Plan::Premium, now())
            .is_none());
    }

    #[test]
    fn test_invalidate() {
        let cache = DecisionCache::new(Duration::minutes(5));
        cache.put(&decision(None), now());
        cache.invalidate_user("u1");
        assert!(cache.is_empty());
    }
}
