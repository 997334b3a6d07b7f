//! Audit trail storage.

mod memory;
mod sqlite;

pub use memory::MemoryAuditLog;
pub use sqlite::SqliteAuditLog;
