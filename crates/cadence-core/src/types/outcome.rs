//! Review outcomes and aggregate session statistics.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use super::item::ContentType;

/// Self-reported difficulty of a review (maps to the usual 4-button UI).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Difficulty {
    /// Failed to recall.
    Again,
    /// Recalled with serious effort.
    Hard,
    /// Recalled normally.
    Good,
    /// Recalled effortlessly.
    Easy,
}

impl Difficulty {
    /// Ease factor adjustment applied on a correct answer.
    ///
    /// `Again` has no delta because it never accompanies a correct answer.
    pub fn ease_delta(self) -> Option<f64> {
        match self {
            Difficulty::Again => None,
            Difficulty::Hard => Some(-0.15),
            Difficulty::Good => Some(0.0),
            Difficulty::Easy => Some(0.15),
        }
    }
}

/// Result of showing one item to the learner.
///
/// Consumed once by the scheduler and folded into the item state and
/// [`SessionStats`]; never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub item_id: String,
    pub correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub response_time_ms: u64,
    /// Set when this review is the learner's first contact with the item,
    /// in which case a missing item is created instead of reported.
    #[serde(default)]
    pub first_exposure: bool,
    /// Kind of the item, needed only to create it on first exposure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
}

impl SessionOutcome {
    /// A correct answer with the given difficulty.
    pub fn correct(item_id: impl Into<String>, difficulty: Difficulty) -> Self {
        Self {
            item_id: item_id.into(),
            correct: true,
            difficulty: Some(difficulty),
            response_time_ms: 0,
            first_exposure: false,
            content_type: None,
        }
    }

    /// A wrong answer.
    pub fn incorrect(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            correct: false,
            difficulty: Some(Difficulty::Again),
            response_time_ms: 0,
            first_exposure: false,
            content_type: None,
        }
    }

    /// Set the response time.
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = ms;
        self
    }

    /// Mark as the first exposure to an item of `content_type`.
    pub fn as_first_exposure(mut self, content_type: ContentType) -> Self {
        self.first_exposure = true;
        self.content_type = Some(content_type);
        self
    }
}

/// Aggregate statistics over review sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub sessions_completed: u64,
    pub items_reviewed: u64,
    pub correct_answers: u64,
    pub total_response_ms: u64,
}

impl SessionStats {
    /// Fold one outcome into the running totals.
    pub fn record(&mut self, outcome: &SessionOutcome) {
        self.items_reviewed += 1;
        if outcome.correct {
            self.correct_answers += 1;
        }
        self.total_response_ms += outcome.response_time_ms;
    }

    /// Fraction of reviews answered correctly, 0.0 when nothing was reviewed.
    pub fn accuracy(&self) -> f64 {
        if self.items_reviewed == 0 {
            0.0
        } else {
            self.correct_answers as f64 / self.items_reviewed as f64
        }
    }

    /// Mean response time in milliseconds.
    pub fn mean_response_ms(&self) -> u64 {
        self.total_response_ms.checked_div(self.items_reviewed).unwrap_or(0)
    }
}
