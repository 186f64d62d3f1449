//! ============================================================================
//! User Locks - One async mutex per user id
//! ============================================================================
//! Every read-modify-persist of a `UserRecord` runs while holding its
//! owner's lock, so two messages from the same user never interleave.
//! Different users never contend.
//! ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Entries beyond this count trigger a sweep of idle locks
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`. Waiters are served in order.
    pub async fn acquire(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() >= PRUNE_THRESHOLD {
                prune_idle(&mut locks);
            }
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits for
    pub async fn prune(&self) {
        prune_idle(&mut *self.locks.lock().await);
    }

    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

fn prune_idle(locks: &mut HashMap<i64, Arc<Mutex<()>>>) {
    let before = locks.len();
    // Only the map holds an idle lock
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    debug!("Pruned {} idle user lock(s)", before - locks.len());
}
