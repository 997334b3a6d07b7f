//! Per-key async locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes read-modify-write cycles on one `(user, key)`.
///
/// Different keys never contend.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `(user_id, key)`.
    pub async fn lock(&self, user_id: &str, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop slots nobody holds so the map tracks live keys only.
            locks.retain(|_, slot| Arc::strong_count(slot) > 1);
            locks
                .entry((user_id.to_string(), key.to_string()))
                .or_default()
                .clone()
        };
        slot.lock_owned().await
    }
}
