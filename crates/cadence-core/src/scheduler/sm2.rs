//! SM-2 style scheduler.
//!
//! Correct answers grow the interval by the item's ease factor and nudge the
//! ease by the reported difficulty. Wrong answers drop the item into a short
//! relearning step and cut the ease.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::{CadenceError, CadenceResult};
use crate::types::{
    Difficulty, ItemStatus, ReviewableItem, SessionOutcome, MIN_EASE_FACTOR,
};

/// Ease penalty for a wrong answer.
const LAPSE_EASE_PENALTY: f64 = 0.2;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Deterministic SM-2 style scheduler.
#[derive(Debug, Clone, Default)]
pub struct Sm2Scheduler {
    config: SchedulerConfig,
}

/// Interval (days) each difficulty would produce, for answer buttons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalPreview {
    pub again: f64,
    pub hard: f64,
    pub good: f64,
    pub easy: f64,
}

impl Sm2Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Apply one review outcome to an item and return its new state.
    ///
    /// The input item is left untouched. Fails with `InvalidInput` when a
    /// correct answer carries no difficulty or carries `again`.
    pub fn apply_outcome(
        &self,
        item: &ReviewableItem,
        outcome: &SessionOutcome,
        now: DateTime<Utc>,
    ) -> CadenceResult<ReviewableItem> {
        if outcome.item_id != item.item_id {
            return Err(CadenceError::invalid_input(format!(
                "outcome for {} applied to item {}",
                outcome.item_id, item.item_id
            )));
        }

        let mut next = item.clone();
        if outcome.correct {
            let delta = outcome
                .difficulty
                .and_then(Difficulty::ease_delta)
                .ok_or_else(|| CadenceError::missing_difficulty(&item.item_id))?;

            next.repetitions += 1;
            next.interval = (item.interval * item.ease_factor).round().max(1.0);
            next.ease_factor = clamp_ease(item.ease_factor + delta);
        } else {
            next.lapses += 1;
            next.repetitions = 0;
            next.interval = self.config.relearn_interval_days();
            next.ease_factor = clamp_ease(item.ease_factor - LAPSE_EASE_PENALTY);
        }

        next.status = self.next_status(item.status, outcome.correct, &next);
        next.last_reviewed_at = Some(now);
        next.next_review_at = Some(now + interval_duration(next.interval));
        Ok(next)
    }

    /// One stage per review: stages are never skipped.
    fn next_status(&self, current: ItemStatus, correct: bool, next: &ReviewableItem) -> ItemStatus {
        match (current, correct) {
            (ItemStatus::New, _) => ItemStatus::Learning,
            (ItemStatus::Learning, true) if next.interval >= 1.0 && next.repetitions >= 1 => {
                ItemStatus::Review
            }
            (ItemStatus::Learning, _) => ItemStatus::Learning,
            (ItemStatus::Review, true) if next.interval >= self.config.mastery_interval_days => {
                ItemStatus::Mastered
            }
            (ItemStatus::Review, true) => ItemStatus::Review,
            (ItemStatus::Mastered, true) => ItemStatus::Mastered,
            (ItemStatus::Review | ItemStatus::Mastered, false) => ItemStatus::Learning,
        }
    }

    /// The interval each answer button would schedule.
    pub fn preview_intervals(&self, item: &ReviewableItem, now: DateTime<Utc>) -> IntervalPreview {
        let interval_for = |difficulty: Difficulty| {
            let outcome = match difficulty {
                Difficulty::Again => SessionOutcome::incorrect(item.item_id.clone()),
                other => SessionOutcome::correct(item.item_id.clone(), other),
            };
            self.apply_outcome(item, &outcome, now)
                .map(|next| next.interval)
                .unwrap_or(item.interval)
        };

        IntervalPreview {
            again: interval_for(Difficulty::Again),
            hard: interval_for(Difficulty::Hard),
            good: interval_for(Difficulty::Good),
            easy: interval_for(Difficulty::Easy),
        }
    }
}

/// Floor at the minimum and round to two decimals so repeated updates do
/// not accumulate float drift.
fn clamp_ease(ease: f64) -> f64 {
    ((ease * 100.0).round() / 100.0).max(MIN_EASE_FACTOR)
}

fn interval_duration(days: f64) -> Duration {
    Duration::milliseconds((days * MILLIS_PER_DAY).round() as i64)
}

/// Format an interval in days to a short human-readable string.
pub fn format_interval(days: f64) -> String {
    if days <= 0.0 {
        return "now".to_string();
    }
    if days < 1.0 {
        let minutes = (days * 24.0 * 60.0).round() as i64;
        return if minutes < 60 {
            format!("{}m", minutes.max(1))
        } else {
            format!("{}h", minutes / 60)
        };
    }

    let days = days.round() as i64;
    if days < 7 {
        format!("{}d", days)
    } else if days < 30 {
        format!("{}w", days / 7)
    } else if days < 365 {
        format!("{}mo", days / 30)
    } else {
        format!("{}y", days / 365)
    }
}
