//! Tiered progress storage.
//!
//! Every write lands in the local tier first. Premium users additionally
//! get their records pushed to the remote tier through a coalescing queue.

mod locks;
mod memory;
mod queue;
mod record;
mod sqlite;
mod tiered;

pub use locks::KeyLocks;
pub use memory::MemoryLocalTier;
pub use queue::{PendingWrite, WriteMode, WriteQueue};
pub use record::{ProgressDelta, ProgressRecord, Register};
pub use sqlite::SqliteProgressStore;
pub use tiered::{MigrationReport, ReconcileReport, TieredStore};
