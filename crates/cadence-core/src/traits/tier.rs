//! Storage tier traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CadenceResult;
use crate::store::{PendingWrite, ProgressRecord};

/// The always-available, device-local tier.
///
/// Writes here complete synchronously and define whether a write "happened"
/// from the user's point of view.
pub trait LocalTier: Send + Sync {
    fn get(&self, user_id: &str, key: &str) -> CadenceResult<Option<ProgressRecord>>;

    fn put(&self, user_id: &str, key: &str, record: &ProgressRecord) -> CadenceResult<()>;

    /// All keys stored for a user, sorted.
    fn keys(&self, user_id: &str) -> CadenceResult<Vec<String>>;

    /// Remember that `write` still has to reach the remote tier, replacing
    /// any earlier entry for the same user and key.
    fn mark_pending(&self, write: &PendingWrite) -> CadenceResult<()>;

    fn clear_pending(&self, user_id: &str, key: &str) -> CadenceResult<()>;

    /// Every remembered write, for every user.
    fn pending(&self) -> CadenceResult<Vec<PendingWrite>>;
}

/// The durable remote tier, reserved for paying users.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    async fn get(&self, user_id: &str, key: &str) -> CadenceResult<Option<ProgressRecord>>;

    async fn put(&self, user_id: &str, key: &str, record: &ProgressRecord) -> CadenceResult<()>;

    /// All keys stored for a user, sorted.
    async fn keys(&self, user_id: &str) -> CadenceResult<Vec<String>>;

    /// When local history was migrated for this user, if ever.
    async fn migration_marker(&self, user_id: &str) -> CadenceResult<Option<DateTime<Utc>>>;

    async fn set_migration_marker(&self, user_id: &str, at: DateTime<Utc>) -> CadenceResult<()>;
}
