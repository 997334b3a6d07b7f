//! Due-item classification in the user's calendar.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{local_midnight, ReviewableItem};

/// Upcoming reviews grouped by when they fall due.
///
/// Buckets are disjoint and each is sorted by due time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DueItems {
    /// Due at or before "now".
    pub due_now: Vec<ReviewableItem>,
    /// Later today, before local midnight.
    pub due_today: Vec<ReviewableItem>,
    /// During the next local day.
    pub due_tomorrow: Vec<ReviewableItem>,
    /// From the day after tomorrow until local midnight seven days out.
    pub due_this_week: Vec<ReviewableItem>,
}

impl DueItems {
    pub fn total(&self) -> usize {
        self.due_now.len() + self.due_today.len() + self.due_tomorrow.len() + self.due_this_week.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Bucket `items` relative to `now` in the calendar of `offset`.
///
/// Items due later than `now + horizon` are left out.
pub fn classify_due(
    items: impl IntoIterator<Item = ReviewableItem>,
    now: DateTime<Utc>,
    offset: FixedOffset,
    horizon: Duration,
) -> DueItems {
    let today = now.with_timezone(&offset).date_naive();
    let end_of_today = local_midnight(today + Duration::days(1), offset);
    let end_of_tomorrow = local_midnight(today + Duration::days(2), offset);
    let end_of_week = local_midnight(today + Duration::days(7), offset);
    let cutoff = now + horizon;

    let mut due = DueItems::default();
    for item in items {
        // Never-scheduled items are due immediately.
        let at = item.next_review_at.unwrap_or(now);
        if at > cutoff {
            continue;
        }
        if at <= now {
            due.due_now.push(item);
        } else if at < end_of_today {
            due.due_today.push(item);
        } else if at < end_of_tomorrow {
            due.due_tomorrow.push(item);
        } else if at < end_of_week {
            due.due_this_week.push(item);
        }
    }

    for bucket in [
        &mut due.due_now,
        &mut due.due_today,
        &mut due.due_tomorrow,
        &mut due.due_this_week,
    ] {
        bucket.sort_by(|a, b| {
            a.next_review_at
                .unwrap_or(now)
                .cmp(&b.next_review_at.unwrap_or(now))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentType;
    use chrono::TimeZone;

    fn item(id: &str, next: Option<DateTime<Utc>>) -> ReviewableItem {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut item = ReviewableItem::new("u1", id, ContentType::Vocabulary, created);
        item.next_review_at = next;
        item
    }

    fn ids(bucket: &[ReviewableItem]) -> Vec<&str> {
        bucket.iter().map(|i| i.item_id.as_str()).collect()
    }

    #[test]
    fn test_buckets_follow_local_calendar() {
        // 20:00 in Tokyo on the 21st.
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 21, 11, 0, 0).unwrap();

        let items = vec![
            item("overdue", Some(now - Duration::hours(30))),
            item("never", None),
            item("tonight", Some(now + Duration::hours(3))),
            // 00:30 local on the 22nd.
            item("after-midnight", Some(now + Duration::minutes(270))),
            item("in-three-days", Some(now + Duration::days(3))),
            item("next-month", Some(now + Duration::days(30))),
        ];

        let due = classify_due(items, now, offset, Duration::days(60));
        assert_eq!(ids(&due.due_now), vec!["overdue", "never"]);
        assert_eq!(ids(&due.due_today), vec!["tonight"]);
        assert_eq!(ids(&due.due_tomorrow), vec!["after-midnight"]);
        assert_eq!(ids(&due.due_this_week), vec!["in-three-days"]);
        assert_eq!(due.total(), 5);
    }

    #[test]
    fn test_horizon_drops_later_items() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 21, 9, 0, 0).unwrap();
        let items = vec![
            item("soon", Some(now + Duration::hours(1))),
            item("later", Some(now + Duration::days(3))),
        ];

        let due = classify_due(items, now, offset, Duration::days(1));
        assert_eq!(ids(&due.due_today), vec!["soon"]);
        assert!(due.due_this_week.is_empty());
    }
}
