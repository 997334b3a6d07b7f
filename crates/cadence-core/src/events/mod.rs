//! Event system for progress lifecycle events
//!
//! This module provides:
//! - Event types for reviews, streak changes, quota exhaustion, policy
//!   violations and tier migration
//! - Event bus for internal pub/sub

mod bus;
mod event;

pub use bus::{EventBus, EventSubscriber};
pub use event::{
    ItemReviewedEvent, MigrationCompletedEvent, PolicyViolationEvent, ProgressEvent,
    QuotaExhaustedEvent, StreakUpdatedEvent,
};
