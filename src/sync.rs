//! Shared keyed map under a reader-writer lock.
//!
//! The policy table, API-key table, circuit-breaker pool and JWKS cache all
//! have the same shape: a private map of owned entries with shared reads and
//! exclusive writes. This module implements that shape once; the owners add
//! their domain semantics on top.
//!
//! Readers always receive value copies (or cloned `Arc`s), never references
//! into the map, so no caller can observe a torn entry and no lock is held
//! across user code.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// Concurrent map with copy-out reads.
#[derive(Debug)]
pub struct SharedMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for SharedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> SharedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a key, returning a copy of the value.
    pub fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    /// Insert or replace an entry.
    pub fn insert(&self, key: K, value: V) {
        self.write().insert(key, value);
    }

    /// Remove an entry, returning it if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.write().remove(key)
    }

    /// Return the existing value for `key`, or insert the one produced by
    /// `make` and return that. The factory runs under the write lock, so
    /// concurrent callers observe a single winner.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(&key) {
            return v;
        }
        let mut guard = self.write();
        guard.entry(key).or_insert_with(make).clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.read().clone()
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.write().retain(|k, v| keep(k, v));
    }

    /// Replace the entire table in one step. Concurrent readers see either
    /// the old map or the new one, never a mixture.
    pub fn replace_all(&self, entries: HashMap<K, V>) {
        *self.write() = entries;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
        // A poisoned lock means a writer panicked mid-update; the maps here
        // hold only owned values, so the data is still structurally sound.
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<K, V>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
