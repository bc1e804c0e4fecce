use std::collections::HashMap;
use std::hash::Hash;

use dashmap::DashMap;

use crate::request::StoreId;

/// Two-level cache: store id, then an arbitrary key.
///
/// Entries live until they are deleted explicitly, one key at a time or a
/// whole store at once.
#[derive(Debug)]
pub struct StoreCache<K, V> {
    stores: DashMap<StoreId, HashMap<K, V>>,
}

impl<K, V> StoreCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
        }
    }

    /// Gets a clone of the value cached under `key` for the given store.
    pub fn get(&self, store_id: &str, key: &K) -> Option<V> {
        self.stores
            .get(store_id)
            .and_then(|store| store.get(key).cloned())
    }

    /// Caches `value` under `key`, replacing any previous value.
    pub fn set(&self, store_id: &str, key: K, value: V) {
        self.stores
            .entry(store_id.to_owned())
            .or_default()
            .insert(key, value);
    }

    /// Drops every entry of the given store.
    pub fn delete_store(&self, store_id: &str) {
        self.stores.remove(store_id);
    }

    pub fn delete_key(&self, store_id: &str, key: &K) {
        if let Some(mut store) = self.stores.get_mut(store_id) {
            store.remove(key);
        }
    }

    /// Removes and returns the entry under `key` if `predicate` accepts it.
    ///
    /// The check and the removal happen under one lock.
    pub fn take_if(&self, store_id: &str, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut store = self.stores.get_mut(store_id)?;
        if store.get(key).is_some_and(predicate) {
            store.remove(key)
        } else {
            None
        }
    }

    /// Number of entries cached for the given store.
    pub fn len(&self, store_id: &str) -> usize {
        self.stores.get(store_id).map_or(0, |store| store.len())
    }
}

impl<K, V> Default for StoreCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
