//! Concurrent name-keyed registry
//!
//! Every table in the communicator (module priorities, notification handlers,
//! connected clients) goes through this type, so each read-modify-write happens
//! under exactly one lock acquisition.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Name-keyed map with single-writer/multi-reader locking
#[derive(Debug)]
pub struct Registry<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Registry<V> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `name` unless the name is taken
    ///
    /// Returns `false` (and leaves the existing entry untouched) on conflict.
    pub fn try_register(&self, name: impl Into<String>, value: V) -> bool {
        let mut entries = self.entries.write();
        let name = name.into();
        if entries.contains_key(&name) {
            return false;
        }
        entries.insert(name, value);
        true
    }

    /// Remove an entry, returning it
    pub fn remove(&self, name: &str) -> Option<V> {
        self.entries.write().remove(name)
    }

    /// Remove an entry only if `matches` accepts it, in one lock acquisition
    pub fn remove_if(&self, name: &str, matches: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut entries = self.entries.write();
        if entries.get(name).is_some_and(matches) {
            entries.remove(name)
        } else {
            None
        }
    }

    /// Check whether a name is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Registered names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<(String, V)> {
        self.entries.write().drain().collect()
    }

    /// Run `f` against an entry while holding the read lock
    pub fn with<R>(&self, name: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.entries.read().get(name).map(f)
    }
}

impl<V: Clone> Registry<V> {
    /// Clone out a single entry
    #[must_use]
    pub fn get(&self, name: &str) -> Option<V> {
        self.entries.read().get(name).cloned()
    }

    /// Clone out every value (snapshot for iteration without holding the lock)
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.entries.read().values().cloned().collect()
    }

    /// Clone out every entry
    #[must_use]
    pub fn entries(&self) -> Vec<(String, V)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
