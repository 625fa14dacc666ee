//! Per-key async lock with automatic cleanup using weak references
//!
//! Used to serialize every operation touching one workload while operations on
//! other workloads proceed in parallel.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

type LockMap<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Guard for one key. Dropping it releases the key and, when no other task
/// holds or waits on the same key, removes the entry from the map.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    arc: Arc<Mutex<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K> KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    /// The key this guard serializes.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // only self.arc is left once the owned guard is gone and nobody waits
        if Arc::strong_count(&self.arc) == 1 {
            if let Entry::Occupied(occupied) = self.locks.entry(self.key.clone()) {
                if occupied.get().strong_count() <= 1 {
                    occupied.remove();
                }
            }
        }
    }
}

/// A per-key async lock manager.
///
/// Calls with the same key are executed one after another in arrival order
/// (tokio's mutex is fair), calls with different keys never contend. Entries
/// live only while some task holds or waits on the key.
///
/// ```rust,ignore
/// let locks = KeyedAsyncLock::<String>::new();
/// let _guard = locks.lock(&"workload-uid".to_string()).await;
/// // prepare / configure / cleanup for this workload
/// ```
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: LockMap<K>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquires the lock for `key`, waiting as long as needed.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let arc = self.get_or_create_lock(key);
        let guard = Arc::clone(&arc).lock_owned().await;
        self.guard(guard, arc, key)
    }

    /// Acquires the lock for `key` unless `deadline` passes first.
    ///
    /// Returns `None` on timeout; the caller still owns nothing in that case.
    pub async fn lock_until(&self, key: &K, deadline: Instant) -> Option<KeyedLockGuard<K>> {
        let arc = self.get_or_create_lock(key);
        let acquired = tokio::time::timeout_at(deadline, Arc::clone(&arc).lock_owned()).await;
        match acquired {
            Ok(guard) => Some(self.guard(guard, arc, key)),
            Err(_) => {
                // we may have been the last interested party
                if Arc::strong_count(&arc) == 1 {
                    if let Entry::Occupied(occupied) = self.locks.entry(key.clone()) {
                        if occupied.get().strong_count() <= 1 {
                            occupied.remove();
                        }
                    }
                }
                None
            }
        }
    }

    fn guard(&self, guard: OwnedMutexGuard<()>, arc: Arc<Mutex<()>>, key: &K) -> KeyedLockGuard<K> {
        KeyedLockGuard {
            guard: Some(guard),
            arc,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn get_or_create_lock(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    // stale entry left behind by a guard racing with us
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
