//! In-memory coherent view of persisted metadata.
//!
//! A `MetadataCache` maps identifiers to cached records. Readers never
//! observe torn records; `snapshot` returns the entries valid at some
//! serialization point during the call. Absence is a valid result: the
//! cache has no error kinds.

use std::collections::HashMap;
use std::sync::RwLock;

/// Identifier → record mapping shared between callback-driven writers and
/// read-only readers.
pub struct MetadataCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V: Clone> MetadataCache<V> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a copy of the record under `id`, if any.
    pub fn get(&self, id: &str) -> Option<V> {
        self.entries.read().expect("lock poisoned").get(id).cloned()
    }

    /// Inserts or replaces the record under `id`.
    pub fn upsert(&self, id: &str, value: V) {
        self.entries
            .write()
            .expect("lock poisoned")
            .insert(id.to_string(), value);
    }

    /// Removes the record under `id`; returns whether it existed.
    pub fn delete(&self, id: &str) -> bool {
        self.entries
            .write()
            .expect("lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Returns a consistent copy of all entries.
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.entries.read().expect("lock poisoned").clone()
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("lock poisoned").is_empty()
    }
}

impl<V: Clone> Default for MetadataCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
