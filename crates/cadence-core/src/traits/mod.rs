//! Collaborator traits the engine is built against.

mod audit;
mod clock;
mod plan;
mod tier;

pub use audit::*;
pub use clock::*;
pub use plan::*;
pub use tier::*;
