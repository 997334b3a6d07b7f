//! Entitlement decisions.
//!
//! Answers "may this user use this feature now, and how much is left" from
//! the plan's limits, admin overrides and the daily usage ledger. Every live
//! answer is audited; simulated answers never are.

mod bridge;
mod cache;
mod ledger;
mod window;

pub use bridge::{EntitlementBridge, QueueFilter};
pub use cache::DecisionCache;
pub use ledger::{FeatureOverride, OverrideStore, SqliteEntitlementStore, UsageLedger};
pub use window::{next_reset, usage_day};

use crate::types::{ContentType, Feature};

/// The feature gating a content type, `None` for content every plan may use.
pub fn feature_for(content_type: ContentType) -> Option<Feature> {
    match content_type {
        ContentType::Hiragana => Some(Feature::HiraganaPractice),
        ContentType::Katakana => Some(Feature::KatakanaPractice),
        ContentType::Kanji => Some(Feature::KanjiPractice),
        ContentType::Vocabulary => Some(Feature::VocabularyReview),
        ContentType::CustomList => Some(Feature::CustomLists),
        ContentType::Sentence | ContentType::Grammar => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_feature_gates_some_content() {
        let gated: Vec<Feature> = ContentType::iter().filter_map(feature_for).collect();
        for feature in Feature::iter() {
            assert!(gated.contains(&feature), "{} gates nothing", feature);
        }
    }

    #[test]
    fn test_ungated_content() {
        assert_eq!(feature_for(ContentType::Sentence), None);
        assert_eq!(feature_for(ContentType::Grammar), None);
    }
}
