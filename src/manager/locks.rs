//! Per-name mutual exclusion.
//!
//! `start`, `stop` and `revert` on the same sandbox name hold the name's
//! lock for their whole duration. Entries are dropped once nobody holds or
//! waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct NameLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NameLocks {
    pub(crate) async fn acquire(self: &Arc<Self>, name: &str) -> NameGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        NameGuard {
            locks: Arc::clone(self),
            name: name.to_string(),
            _guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub(crate) struct NameGuard {
    locks: Arc<NameLocks>,
    name: String,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        // Release the async lock first so the strong count reflects waiters only.
        drop(self._guard.take());
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(&self.name)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(&self.name);
        }
    }
}
