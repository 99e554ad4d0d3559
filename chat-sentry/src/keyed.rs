//! A concurrent keyed store with read-preferring access pattern.
//!
//! This module provides a simple concurrent map with limited API, which
//! fills in requested records that don't exist using `Default`, taking a
//! write lock only when necessary to do so.
//!
//! This is used to hold per-key admission records (counters, spam records),
//! where the set of active keys is small relative to traffic: almost all
//! accesses hit an existing record, and from that point on only read locks
//! are taken when using this API. Mutation of an individual record goes
//! through interior mutability on the value type, so the read-modify-write
//! of an admission check is serialized per key, not per store.
//!
//! The API also allows `retain` so the janitor can prune expired records,
//! and `clear` as an operator escape hatch.
//!
//! This is used instead of dash_map and once_map to avoid unnecessary
//! complexity and dependencies, and give exactly the API needed here.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

/// A concurrent string-keyed store that uses read-preferring locking.
///
/// When accessing a record, it first tries to acquire a read lock. If the key
/// exists, it uses the record immediately. If the key doesn't exist, it
/// upgrades to a write lock, inserts a default record, and then accesses it.
#[derive(Debug)]
pub struct KeyedStore<V> {
    inner: RwLock<HashMap<String, V>>,
    len_cache: AtomicUsize,
}

impl<V: Default> KeyedStore<V> {
    /// Make a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find and access a record. If it doesn't exist, insert `V::default()` first.
    ///
    /// Note: May deadlock if `access` calls back into the same store.
    pub fn get<R>(&self, key: &str, access: impl FnOnce(&V) -> R) -> R {
        // Try to get the existing record with a read lock first
        {
            let guard = self.inner.read().unwrap();
            if let Some(value) = guard.get(key) {
                return access(value);
            }
        }

        // Record doesn't exist, need to create with a write lock
        let mut guard = self.inner.write().unwrap();
        let value = guard.entry(key.to_owned()).or_insert_with(|| {
            self.len_cache.fetch_add(1, Ordering::SeqCst);
            V::default()
        });
        access(value)
    }

    /// Access a record only if it already exists. Never inserts.
    pub fn peek<R>(&self, key: &str, access: impl FnOnce(&V) -> R) -> Option<R> {
        let guard = self.inner.read().unwrap();
        guard.get(key).map(access)
    }

    /// Retain only records that satisfy the predicate. Returns the new length.
    pub fn retain(&self, f: impl FnMut(&String, &mut V) -> bool) -> usize {
        let mut guard = self.inner.write().unwrap();
        guard.retain(f);
        let len = guard.len();
        self.len_cache.store(len, Ordering::SeqCst);
        len
    }

    /// Drop every record. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut guard = self.inner.write().unwrap();
        let len = guard.len();
        guard.clear();
        self.len_cache.store(0, Ordering::SeqCst);
        len
    }

    /// Get the number of records in the store.
    pub fn len(&self) -> usize {
        self.len_cache.load(Ordering::SeqCst)
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for KeyedStore<V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Default::default()),
            len_cache: Default::default(),
        }
    }
}
