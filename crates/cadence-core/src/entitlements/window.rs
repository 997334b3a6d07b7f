//! Daily quota window.
//!
//! Quotas reset at UTC midnight for every user, independent of the user's
//! own calendar.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// The quota day containing `at`.
pub fn usage_day(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}

/// The first UTC midnight strictly after `at`.
pub fn next_reset(at: DateTime<Utc>) -> DateTime<Utc> {
    let next_day = usage_day(at) + Duration::days(1);
    DateTime::from_naive_utc_and_offset(next_day.and_time(NaiveTime::MIN), Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_reset() {
        let at = Utc.with_ymd_and_hms(2024, 1, 21, 23, 59, 59).unwrap();
        assert_eq!(next_reset(at), Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap());

        let midnight = Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap();
        assert_eq!(next_reset(midnight), Utc.with_ymd_and_hms(2024, 1, 23, 0, 0, 0).unwrap());
    }
}
