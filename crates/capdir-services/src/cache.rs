//! Expiring multi-cache.
//!
//! Maps a key to zero or more values, each stamped with its insertion time.
//! Reads can filter by age and `cleanup` evicts by age. One mutex guards the
//! whole container; every call is short, so there is no per-key locking.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use capdir_core::{CacheMaxAge, Clock};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at_ms: u64,
}

pub struct ExpiringMultiCache<K, V> {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, Vec<CacheEntry<V>>>>,
}

impl<K, V> ExpiringMultiCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Vec<CacheEntry<V>>>> {
        // Every critical section leaves the map consistent, so a panic
        // elsewhere never invalidates it.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a value under `key`, stamped now. No deduplication.
    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, self.clock.now_ms());
    }

    /// `insert` with an explicit timestamp, so several caches indexing the
    /// same value can share one stamp.
    pub fn insert_at(&self, key: K, value: V, inserted_at_ms: u64) {
        self.lock().entry(key).or_default().push(CacheEntry {
            value,
            inserted_at_ms,
        });
    }

    /// Values for `key` that satisfy `max_age`, in insertion order.
    pub fn lookup(&self, key: &K, max_age: CacheMaxAge) -> Vec<V> {
        let now = self.clock.now_ms();
        self.lock()
            .get(key)
            .map(|list| {
                list.iter()
                    .filter(|e| max_age.admits(now.saturating_sub(e.inserted_at_ms)))
                    .map(|e| e.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn lookup_all(&self, key: &K) -> Vec<V> {
        self.lookup(key, CacheMaxAge::Unbounded)
    }

    /// Remove one entry equal to `value`. Returns whether one was found.
    pub fn remove(&self, key: &K, value: &V) -> bool {
        let mut map = self.lock();
        let Some(list) = map.get_mut(key) else {
            return false;
        };
        let found = match list.iter().position(|e| &e.value == value) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        };
        if list.is_empty() {
            map.remove(key);
        }
        found
    }

    /// Remove every entry under `key` matching `pred`, returning the values.
    pub fn remove_where(&self, key: &K, pred: impl Fn(&V) -> bool) -> Vec<V> {
        let mut map = self.lock();
        let Some(list) = map.get_mut(key) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        list.retain(|e| {
            if pred(&e.value) {
                removed.push(e.value.clone());
                false
            } else {
                true
            }
        });
        if list.is_empty() {
            map.remove(key);
        }
        removed
    }

    pub fn remove_all(&self, key: &K) -> Vec<V> {
        self.lock()
            .remove(key)
            .map(|list| list.into_iter().map(|e| e.value).collect())
            .unwrap_or_default()
    }

    /// Drop every entry older than `max_age`. Returns how many were dropped.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_at(max_age, self.clock.now_ms())
    }

    /// `cleanup` measured against `now`.
    pub fn cleanup_at(&self, max_age: Duration, now: u64) -> usize {
        let max_age_ms = max_age.as_millis() as u64;
        let mut removed = 0;
        self.lock().retain(|_, list| {
            let before = list.len();
            list.retain(|e| now.saturating_sub(e.inserted_at_ms) <= max_age_ms);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Snapshot of keys holding at least one value.
    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    /// Snapshot of every value regardless of age.
    pub fn values(&self) -> Vec<V> {
        self.lock()
            .values()
            .flat_map(|list| list.iter().map(|e| e.value.clone()))
            .collect()
    }

    /// Total number of values across all keys.
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
