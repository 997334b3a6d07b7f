//! Entitlement decision types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

use super::tier::Plan;

/// Sentinel for "no quota applies".
pub const UNLIMITED: i64 = -1;

/// Gated product features.
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
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Feature {
    HiraganaPractice,
    KatakanaPractice,
    KanjiPractice,
    VocabularyReview,
    CustomLists,
}

/// Why a decision came out the way it did.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionReason {
    Allowed,
    LimitReached,
    NotEntitled,
    AdminOverride,
}

/// Answer to "may this user use this feature now, and how much is left".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementDecision {
    pub user_id: String,
    pub feature: Feature,
    pub plan: Plan,
    pub allow: bool,
    /// Uses left in the current window, or [`UNLIMITED`].
    pub remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at_utc: Option<DateTime<Utc>>,
    pub reason: DecisionReason,
    pub evaluated_at: DateTime<Utc>,
    /// True when evaluated "as of" an administrator-chosen instant.
    #[serde(default)]
    pub simulated: bool,
}

impl EntitlementDecision {
    pub fn is_unlimited(&self) -> bool {
        self.remaining == UNLIMITED
    }

    /// Number of gated items this decision admits, `None` meaning all of them.
    pub fn admits(&self) -> Option<usize> {
        if !self.allow {
            Some(0)
        } else if self.is_unlimited() {
            None
        } else {
            Some(self.remaining.max(0) as usize)
        }
    }

    /// Whether a caller should surface an upgrade prompt for this decision.
    ///
    /// Only quota exhaustion on an upgradable plan qualifies; a premium
    /// denial means the feature is absent and is never an upsell.
    pub fn should_prompt_upgrade(&self) -> bool {
        self.reason == DecisionReason::LimitReached && self.plan.can_upgrade()
    }
}

/// Identity of whoever triggered an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// The learner themself, through the review flow.
    User(String),
    /// An administrator acting on someone else's account.
    Admin(String),
    /// Background processes.
    System,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::Admin(id) => write!(f, "admin:{}", id),
            Actor::System => write!(f, "system"),
        }
    }
}

/// Options for one entitlement evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateOptions {
    /// Evaluate as of this instant instead of the clock's "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate_at: Option<DateTime<Utc>>,
    /// Dry-run request to keep the evaluation out of the audit log.
    /// Honoured for simulated evaluations only.
    #[serde(default)]
    pub skip_logging: bool,
    pub actor: Actor,
}

impl EvaluateOptions {
    /// A live evaluation on behalf of the learner.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            simulate_at: None,
            skip_logging: false,
            actor: Actor::User(user_id.into()),
        }
    }

    /// An administrator dry run as of `at`, kept out of the audit log.
    pub fn simulation(admin_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            simulate_at: Some(at),
            skip_logging: true,
            actor: Actor::Admin(admin_id.into()),
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulate_at.is_some()
    }
}

/// Audit record of one live entitlement evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementLogEntry {
    pub id: Uuid,
    pub actor: Actor,
    pub decision: EntitlementDecision,
    pub logged_at: DateTime<Utc>,
}

impl EntitlementLogEntry {
    pub fn new(actor: Actor, decision: EntitlementDecision, logged_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor,
            decision,
            logged_at,
        }
    }
}
