//! Streak walk and risk check.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use std::collections::BTreeSet;

use crate::config::StreakConfig;
use crate::types::{local_midnight, StreakRisk, StreakState};

/// Hours before midnight at which an idle streak is flagged.
pub const DEFAULT_RISK_THRESHOLD_HOURS: f64 = 4.0;

/// Pure streak computation.
#[derive(Debug, Clone, Default)]
pub struct StreakCalculator {
    config: StreakConfig,
}

impl StreakCalculator {
    pub fn new(config: StreakConfig) -> Self {
        Self { config }
    }

    /// Compute the streak state for `today` from every active day.
    ///
    /// Walks the days newest first. A streak is not broken until a full day
    /// passes without activity, so when today has no activity yet the walk
    /// may start from yesterday. Days after `today` are ignored.
    pub fn compute(
        &self,
        active_dates: &BTreeSet<NaiveDate>,
        prior_best: u32,
        today: NaiveDate,
    ) -> StreakState {
        let mut current = 0u32;
        let mut cursor = today;
        for &date in active_dates.range(..=today).rev() {
            if date == cursor {
                current += 1;
                cursor = cursor - Duration::days(1);
            } else if current == 0 && date == cursor - Duration::days(1) {
                current += 1;
                cursor = cursor - Duration::days(2);
            } else {
                break;
            }
        }

        StreakState {
            active_dates: active_dates.clone(),
            current_streak: current,
            best_streak: prior_best.max(current),
            last_activity_date: active_dates.iter().next_back().copied(),
            is_active_today: active_dates.contains(&today),
        }
    }

    /// Advisory check of whether the streak breaks at the coming midnight.
    pub fn streak_risk(&self, state: &StreakState, now_local: DateTime<FixedOffset>) -> StreakRisk {
        let offset = *now_local.offset();
        let tomorrow = now_local.date_naive() + Duration::days(1);
        let midnight = local_midnight(tomorrow, offset);
        let seconds_left = (midnight - now_local.with_timezone(&Utc)).num_seconds().max(0);
        let hours_remaining = seconds_left as f64 / 3600.0;

        StreakRisk {
            hours_remaining,
            at_risk: !state.is_active_today
                && state.current_streak > 0
                && hours_remaining < self.config.risk_threshold_hours,
        }
    }
}
