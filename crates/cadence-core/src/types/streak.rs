//! Streak state types.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Store key of the per-user streak record.
pub const STREAK_KEY: &str = "streak";

/// Consecutive-day engagement state for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    /// Every calendar day (user-local) with at least one recorded activity.
    pub active_dates: BTreeSet<NaiveDate>,
    pub current_streak: u32,
    /// Never lower than `current_streak`.
    pub best_streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_date: Option<NaiveDate>,
    pub is_active_today: bool,
}

/// Advisory "your streak is about to break" signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreakRisk {
    /// Hours until the user's local midnight.
    pub hours_remaining: f64,
    pub at_risk: bool,
}
