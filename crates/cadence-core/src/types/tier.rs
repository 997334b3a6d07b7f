//! Subscription tier context.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{CadenceError, CadenceResult};

/// Subscription plan of a user.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Plan {
    Guest,
    Free,
    Premium,
}

impl Plan {
    /// Whether this plan may write to the durable remote tier.
    pub fn uses_remote_tier(self) -> bool {
        matches!(self, Plan::Premium)
    }

    /// Whether a quota denial on this plan should be presented as an upsell.
    pub fn can_upgrade(self) -> bool {
        matches!(self, Plan::Guest | Plan::Free)
    }
}

/// Who the engine is acting for, and on which plan.
///
/// `utc_offset_seconds` anchors the user's calendar: streak days, "due today"
/// windows and the at-risk countdown are all computed in this offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierContext {
    pub user_id: String,
    pub plan: Plan,
    pub utc_offset_seconds: i32,
}

impl TierContext {
    pub fn new(user_id: impl Into<String>, plan: Plan, utc_offset_seconds: i32) -> Self {
        Self {
            user_id: user_id.into(),
            plan,
            utc_offset_seconds,
        }
    }

    /// The user's fixed offset.
    pub fn offset(&self) -> CadenceResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_seconds).ok_or_else(|| {
            CadenceError::invalid_input(format!(
                "utc offset {}s is out of range",
                self.utc_offset_seconds
            ))
        })
    }

    /// The user's calendar date at `now`.
    pub fn local_date(&self, now: DateTime<Utc>) -> CadenceResult<NaiveDate> {
        Ok(now.with_timezone(&self.offset()?).date_naive())
    }

    /// The UTC instant at which local day `date` begins for this user.
    pub fn start_of_day(&self, date: NaiveDate) -> CadenceResult<DateTime<Utc>> {
        Ok(local_midnight(date, self.offset()?))
    }

    /// Reject contexts that do not identify anyone.
    pub fn ensure_authenticated(&self) -> CadenceResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(CadenceError::not_authenticated("no user id on the request"));
        }
        Ok(())
    }
}

/// The UTC instant of local midnight starting `date` in `offset`.
pub fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    let utc = local - Duration::seconds(offset.local_minus_utc() as i64);
    DateTime::from_naive_utc_and_offset(utc, Utc)
}
