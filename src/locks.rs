use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// One async mutex per key, created on first use and dropped once nobody
/// holds or waits on it. Keys never contend with each other.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Slots,
}

/// Held lock on one key. Releasing the last reference prunes the key.
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
    key: String,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(key.to_owned()).or_default())
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> KeyGuard {
        KeyGuard {
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
            key: key.to_owned(),
        }
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let guard = self.slot(key).lock_owned().await;
        self.guard(key, guard)
    }

    /// `None` when another holder has the key.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let slot = self.slot(key);
        match slot.try_lock_owned() {
            Ok(guard) => Some(self.guard(key, guard)),
            Err(_) => {
                prune(&self.slots, key);
                None
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Removes `key` when the map holds the only reference: no holder, no waiter.
fn prune(slots: &Slots, key: &str) {
    let mut map = slots
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if map
        .get(key)
        .is_some_and(|slot| Arc::strong_count(slot) == 1)
    {
        map.remove(key);
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.slots, &self.key);
    }
}
