//! Progress lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Feature, ItemStatus, Plan};

/// Events emitted while the engine mutates progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ItemReviewed(ItemReviewedEvent),
    StreakUpdated(StreakUpdatedEvent),
    QuotaExhausted(QuotaExhaustedEvent),
    PolicyViolation(PolicyViolationEvent),
    MigrationCompleted(MigrationCompletedEvent),
}

impl ProgressEvent {
    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ItemReviewed(_) => "item.reviewed",
            Self::StreakUpdated(_) => "streak.updated",
            Self::QuotaExhausted(_) => "quota.exhausted",
            Self::PolicyViolation(_) => "store.policy_violation",
            Self::MigrationCompleted(_) => "store.migration_completed",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::ItemReviewed(e) => &e.user_id,
            Self::StreakUpdated(e) => &e.user_id,
            Self::QuotaExhausted(e) => &e.user_id,
            Self::PolicyViolation(e) => &e.user_id,
            Self::MigrationCompleted(e) => &e.user_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ItemReviewed(e) => e.timestamp,
            Self::StreakUpdated(e) => e.timestamp,
            Self::QuotaExhausted(e) => e.timestamp,
            Self::PolicyViolation(e) => e.timestamp,
            Self::MigrationCompleted(e) => e.timestamp,
        }
    }
}

/// An outcome was applied to an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReviewedEvent {
    pub event_id: String,
    pub user_id: String,
    pub item_id: String,
    pub correct: bool,
    pub previous_status: ItemStatus,
    pub status: ItemStatus,
    /// Days until the next review.
    pub interval: f64,
    pub timestamp: DateTime<Utc>,
}

impl ItemReviewedEvent {
    pub fn new(
        user_id: impl Into<String>,
        item_id: impl Into<String>,
        correct: bool,
        previous_status: ItemStatus,
        status: ItemStatus,
        interval: f64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            item_id: item_id.into(),
            correct,
            previous_status,
            status,
            interval,
            timestamp: Utc::now(),
        }
    }

    /// Whether the item changed lifecycle stage.
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.status
    }
}

/// The streak record changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakUpdatedEvent {
    pub event_id: String,
    pub user_id: String,
    pub current_streak: u32,
    pub best_streak: u32,
    pub timestamp: DateTime<Utc>,
}

impl StreakUpdatedEvent {
    pub fn new(user_id: impl Into<String>, current_streak: u32, best_streak: u32) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            current_streak,
            best_streak,
            timestamp: Utc::now(),
        }
    }
}

/// A live evaluation found the daily quota used up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaExhaustedEvent {
    pub event_id: String,
    pub user_id: String,
    pub feature: Feature,
    pub plan: Plan,
    pub timestamp: DateTime<Utc>,
}

impl QuotaExhaustedEvent {
    pub fn new(user_id: impl Into<String>, feature: Feature, plan: Plan) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            feature,
            plan,
            timestamp: Utc::now(),
        }
    }
}

/// A write to the remote tier was refused for the user's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolationEvent {
    pub event_id: String,
    pub user_id: String,
    pub plan: Plan,
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

impl PolicyViolationEvent {
    pub fn new(user_id: impl Into<String>, plan: Plan, key: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            plan,
            key: key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Local history was copied to the remote tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCompletedEvent {
    pub event_id: String,
    pub user_id: String,
    pub migrated_keys: usize,
    pub timestamp: DateTime<Utc>,
}

impl MigrationCompletedEvent {
    pub fn new(user_id: impl Into<String>, migrated_keys: usize) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            migrated_keys,
            timestamp: Utc::now(),
        }
    }
}
