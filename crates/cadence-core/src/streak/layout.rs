//! Persisted layout of the streak record.
//!
//! The record is flat: one `YYYY-MM-DD -> true` register per active day plus
//! the scalar registers below. Nothing else is ever written.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::store::{ProgressDelta, ProgressRecord};
use crate::streak::{normalize_activity, NormalizedActivity};
use crate::types::StreakState;

const BEST_STREAK: &str = "best_streak";
const CURRENT_STREAK: &str = "current_streak";
const LAST_ACTIVITY_DATE: &str = "last_activity_date";

const SCALARS: [&str; 3] = [BEST_STREAK, CURRENT_STREAK, LAST_ACTIVITY_DATE];

/// Streak inputs recovered from a stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreakRecord {
    pub activity: NormalizedActivity,
    pub prior_best: u32,
}

impl StreakRecord {
    /// Whether the stored record must be rewritten in the flat layout.
    pub fn needs_rewrite(&self) -> bool {
        !self.activity.was_clean
    }
}

/// Read the active days and best streak out of a stored record.
pub fn read_streak_record(record: Option<&ProgressRecord>) -> StreakRecord {
    let Some(record) = record else {
        return StreakRecord {
            activity: NormalizedActivity {
                was_clean: true,
                ..Default::default()
            },
            prior_best: 0,
        };
    };

    let raw: Map<String, Value> = record
        .registers
        .iter()
        .filter(|(name, _)| !SCALARS.contains(&name.as_str()))
        .map(|(name, register)| (name.clone(), register.value.clone()))
        .collect();

    StreakRecord {
        activity: normalize_activity(&Value::Object(raw)),
        prior_best: record.register_as(BEST_STREAK).unwrap_or(0),
    }
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Delta marking `date` active and storing the recomputed scalars.
pub fn activity_delta(date: Option<NaiveDate>, state: &StreakState, at: DateTime<Utc>) -> ProgressDelta {
    let mut delta = ProgressDelta::at(at)
        .set(BEST_STREAK, state.best_streak)
        .set(CURRENT_STREAK, state.current_streak);
    if let Some(last) = state.last_activity_date {
        delta = delta.set(LAST_ACTIVITY_DATE, date_key(last));
    }
    if let Some(date) = date {
        delta = delta.set(date_key(date), true);
    }
    delta
}

/// A fresh record in the flat layout holding `state`.
pub fn flat_record(state: &StreakState, at: DateTime<Utc>) -> ProgressRecord {
    let mut delta = activity_delta(None, state, at);
    for &date in &state.active_dates {
        delta = delta.set(date_key(date), true);
    }
    let mut record = ProgressRecord::new();
    record.apply(&delta, "");
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streak::StreakCalculator;
    use chrono::TimeZone;
    use serde_json::json;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 21, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_record_is_clean_and_empty() {
        let read = read_streak_record(None);
        assert!(!read.needs_rewrite());
        assert!(read.activity.dates.is_empty());
        assert_eq!(read.prior_best, 0);
    }

    #[test]
    fn test_written_record_reads_back_clean() {
        let calc = StreakCalculator::default();
        let days = std::collections::BTreeSet::from([d("2024-01-20"), d("2024-01-21")]);
        let state = calc.compute(&days, 7, d("2024-01-21"));

        let mut record = ProgressRecord::new();
        record.apply(&activity_delta(Some(d("2024-01-20")), &state, at()), "phone");
        record.apply(&activity_delta(Some(d("2024-01-21")), &state, at()), "phone");

        let read = read_streak_record(Some(&record));
        assert!(!read.needs_rewrite());
        assert_eq!(read.prior_best, 7);
        assert_eq!(read.activity.dates, state.active_dates);
    }

    #[test]
    fn test_nested_record_needs_rewrite_and_flat_record_is_clean() {
        let mut record = ProgressRecord::new();
        record.apply(
            &ProgressDelta::at(at())
                .set("dates", json!({ "2024-01-19": true }))
                .set("2024-01-20", true),
            "old-client",
        );

        let read = read_streak_record(Some(&record));
        assert!(read.needs_rewrite());

        let state = StreakCalculator::default().compute(&read.activity.dates, read.prior_best, d("2024-01-21"));
        let healed = flat_record(&state, at());
        let reread = read_streak_record(Some(&healed));
        assert!(!reread.needs_rewrite());
        assert_eq!(reread.activity.dates, state.active_dates);
        assert_eq!(healed.register("dates"), None);
    }
}
