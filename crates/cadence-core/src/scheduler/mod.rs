//! Spaced repetition scheduling.
//!
//! - `sm2`: the SM-2 style state update applied after every review
//! - `due`: calendar bucketing of upcoming reviews for reporting

mod due;
mod sm2;

pub use due::{classify_due, DueItems};
pub use sm2::{format_interval, IntervalPreview, Sm2Scheduler};
