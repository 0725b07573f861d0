//! Per-destination mutual exclusion for backup cycles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async mutex per destination directory, so cycles writing
/// to the same directory run one at a time while different directories
/// proceed independently.
#[derive(Clone, Default)]
pub struct DestinationLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every orchestrator in the process
    pub fn global() -> Self {
        static GLOBAL: OnceLock<DestinationLocks> = OnceLock::new();
        GLOBAL.get_or_init(DestinationLocks::new).clone()
    }

    /// Wait for exclusive use of `destination`.
    pub async fn acquire(&self, destination: &Path) -> OwnedMutexGuard<()> {
        self.lock_for(destination).lock_owned().await
    }

    /// Exclusive use of `destination` if no cycle currently holds it
    #[cfg(test)]
    pub fn try_acquire(&self, destination: &Path) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(destination).try_lock_owned().ok()
    }

    fn lock_for(&self, destination: &Path) -> Arc<AsyncMutex<()>> {
        let key = lock_key(destination);
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key).or_default().clone()
    }
}

/// `a/b` and `./a/b/` must share a lock; canonical form once the directory exists.
fn lock_key(destination: &Path) -> PathBuf {
    std::fs::canonicalize(destination).unwrap_or_else(|_| destination.components().collect())
}
