//! Core types for cadence.

mod entitlement;
mod item;
mod outcome;
mod streak;
mod tier;

pub use entitlement::*;
pub use item::*;
pub use outcome::*;
pub use streak::*;
pub use tier::*;
