//! Keyed mutex map
//!
//! One `tokio::sync::Mutex` per key, created on first use and evicted as
//! soon as nobody holds or waits on it, so idle users pin no memory.
//!
//! ```rust,no_run
//! use hubsync::backend::runtime::KeyedLocks;
//!
//! # async fn example() {
//! let locks: KeyedLocks<i64> = KeyedLocks::new();
//! match locks.try_acquire(7) {
//!     Some(_guard) => { /* exclusive section for user 7 */ }
//!     None => { /* someone else is syncing user 7 */ }
//! }
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

pub struct KeyedLocks<K> {
    slots: Slots<K>,
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Take the lock for `key` if nobody holds it
    pub fn try_acquire(&self, key: K) -> Option<KeyedGuard<K>> {
        let slot = self.slot(&key);
        let guard = slot.try_lock_owned().ok();
        match guard {
            Some(guard) => Some(KeyedGuard {
                key,
                slots: self.slots.clone(),
                guard: Some(guard),
            }),
            None => None,
        }
    }

    /// Wait for the lock for `key`
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let slot = self.slot(&key);
        let guard = slot.lock_owned().await;
        KeyedGuard {
            key,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Keys with a live entry (held or awaited)
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock for one key; releases and evicts on drop
pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    slots: Slots<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> KeyedGuard<K>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> fmt::Debug for KeyedGuard<K>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard").field("key", &self.key).finish()
    }
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map still points at the mutex: nobody waits on it
        let idle = slots
            .get(&self.key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            slots.remove(&self.key);
        }
    }
}
