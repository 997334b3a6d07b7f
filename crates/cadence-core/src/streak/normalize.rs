//! Normalization of stored activity dates.
//!
//! Older clients wrote activity in several shapes: nested maps, dotted key
//! paths, or stray non-date keys. Every shape collapses into one flat set of
//! valid calendar dates here.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

static DATE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

/// Result of normalizing stored activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedActivity {
    pub dates: BTreeSet<NaiveDate>,
    /// True when the input was already a flat `date -> true` map.
    pub was_clean: bool,
}

/// Collect every active date found anywhere in `raw`.
///
/// A key counts as a date when it, or its last dotted segment, reads
/// `YYYY-MM-DD` and names a real calendar day. The day is active when its
/// value is `true` or a nested object. Everything else is dropped.
pub fn normalize_activity(raw: &Value) -> NormalizedActivity {
    let mut out = NormalizedActivity {
        dates: BTreeSet::new(),
        was_clean: raw.is_object(),
    };
    if let Value::Object(map) = raw {
        for (key, value) in map {
            scan(key, value, true, &mut out);
        }
    }
    out
}

fn scan(key: &str, value: &Value, top_level: bool, out: &mut NormalizedActivity) {
    match date_of(key) {
        Some((date, dotted)) => {
            let clean = top_level && !dotted && value == &Value::Bool(true);
            if !clean {
                out.was_clean = false;
            }
            match value {
                Value::Bool(true) => {
                    out.dates.insert(date);
                }
                Value::Object(children) => {
                    out.dates.insert(date);
                    for (child_key, child) in children {
                        scan(child_key, child, false, out);
                    }
                }
                _ => {}
            }
        }
        None => {
            out.was_clean = false;
            if let Value::Object(children) = value {
                for (child_key, child) in children {
                    scan(child_key, child, false, out);
                }
            }
        }
    }
}

/// Parse a date key, reporting whether it came from a dotted path.
fn date_of(key: &str) -> Option<(NaiveDate, bool)> {
    let segment = key.rsplit('.').next().unwrap_or(key);
    if !DATE_KEY.is_match(segment) {
        return None;
    }
    NaiveDate::parse_from_str(segment, "%Y-%m-%d")
        .ok()
        .map(|date| (date, segment.len() != key.len()))
}
