//! Consecutive-day streak tracking.
//!
//! The calculator is pure: it maps a set of active calendar days and the
//! best streak seen so far to a [`StreakState`](crate::types::StreakState).
//! Stored activity passes through the normalizer before any streak math.

mod calculator;
mod layout;
mod normalize;

pub use calculator::{StreakCalculator, DEFAULT_RISK_THRESHOLD_HOURS};
pub use layout::{activity_delta, flat_record, read_streak_record, StreakRecord};
pub use normalize::{normalize_activity, NormalizedActivity};
