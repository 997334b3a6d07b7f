//! cadence-core - Core library for cadence.
//!
//! A spaced repetition progress engine: SM-2 scheduling, daily streaks, a
//! local-first progress store with a premium-only durable remote tier, and
//! quota-based entitlement decisions.
//!
//! # Example
//!
//! ```ignore
//! use cadence_core::{EngineConfig, ProgressEngine, SessionOutcome, Difficulty, StaticPlanProvider};
//!
//! let plans = Arc::new(StaticPlanProvider::new(0));
//! let engine = ProgressEngine::builder(EngineConfig::default(), plans).build()?;
//!
//! let outcome = SessionOutcome::correct("kanji-1", Difficulty::Good)
//!     .as_first_exposure(ContentType::Kanji);
//! let item = engine.submit_outcome("user1", &outcome).await?;
//! let streak = engine.get_streak("user1").await?;
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod streak;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{EngineConfig, Limit};
pub use engine::{EngineBuilder, ProgressEngine, ReviewSession};
pub use entitlements::{EntitlementBridge, FeatureOverride, QueueFilter};
pub use error::{CadenceError, CadenceResult, ErrorCode};
pub use events::{EventBus, ProgressEvent};
pub use runtime::BackgroundRuntime;
pub use scheduler::{DueItems, Sm2Scheduler};
pub use store::{MigrationReport, ReconcileReport, TieredStore};
pub use streak::StreakCalculator;
pub use traits::{AuditSink, Clock, PlanProvider, StaticPlanProvider, SystemClock};
pub use types::{
    Actor, ContentType, DecisionReason, Difficulty, EntitlementDecision, EvaluateOptions, Feature,
    ItemStatus, Plan, ReviewableItem, SessionOutcome, SessionStats, StreakRisk, StreakState,
    TierContext,
};
