//! Reviewable item types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Ease factor assigned to freshly introduced items.
pub const DEFAULT_EASE_FACTOR: f64 = 2.5;

/// Floor for the ease factor.
pub const MIN_EASE_FACTOR: f64 = 1.3;

/// Lifecycle status of an item in the spaced repetition system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemStatus {
    /// Introduced but never reviewed.
    #[default]
    New,
    /// In the short-interval learning (or relearning) phase.
    Learning,
    /// Regular spaced review.
    Review,
    /// Interval has reached the mastery threshold.
    Mastered,
}

/// Kind of learning content an item refers to.
///
/// The set is closed: every variant has an explicit entitlement mapping in
/// [`crate::entitlements::feature_for`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentType {
    Hiragana,
    Katakana,
    Kanji,
    Vocabulary,
    Sentence,
    Grammar,
    CustomList,
}

/// Spaced repetition state of one item for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewableItem {
    /// Owner of this progress state.
    pub user_id: String,
    /// Content identifier.
    pub item_id: String,
    /// Kind of content, used for entitlement gating.
    pub content_type: ContentType,
    pub status: ItemStatus,
    /// Current repeat interval in days. Fractional during relearning.
    pub interval: f64,
    pub ease_factor: f64,
    /// Successful reviews since the last lapse.
    pub repetitions: u32,
    /// Lifetime count of failed reviews.
    pub lapses: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reviewed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<DateTime<Utc>>,
}

impl ReviewableItem {
    /// Create the state for an item on first exposure.
    ///
    /// New items are due immediately.
    pub fn new(
        user_id: impl Into<String>,
        item_id: impl Into<String>,
        content_type: ContentType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            content_type,
            status: ItemStatus::New,
            interval: 0.0,
            ease_factor: DEFAULT_EASE_FACTOR,
            repetitions: 0,
            lapses: 0,
            created_at: now,
            last_reviewed_at: None,
            next_review_at: Some(now),
        }
    }

    /// Store key under which this item's progress record lives.
    pub fn store_key(&self) -> String {
        item_key(&self.item_id)
    }

    /// Whether the item should be shown at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// Prefix of every item record key in the progress store.
pub const ITEM_KEY_PREFIX: &str = "item:";

/// Build the store key for an item id.
pub fn item_key(item_id: &str) -> String {
    format!("{}{}", ITEM_KEY_PREFIX, item_id)
}
