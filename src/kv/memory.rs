//! In-memory key-value store.

use super::KeyValueStore;
use crate::error::{Result, SnapshotError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Map-backed store. Can be switched read-only to simulate a full or
/// write-protected medium.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail (or succeed again).
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.entries.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(SnapshotError::storage(key, "store is read-only"));
        }
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_remove() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("assets").unwrap(), None);

        store.set("assets", "[1]").unwrap();
        store.set("assets", "[1,2]").unwrap();
        assert_eq!(store.get("assets").unwrap().as_deref(), Some("[1,2]"));
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove("assets").as_deref(), Some("[1,2]"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        store.set("people", "[]").unwrap();
        store.set_read_only(true);

        let err = store.set("people", "[\"ana\"]").unwrap_err();
        assert!(err.is_storage());
        assert_eq!(store.get("people").unwrap().as_deref(), Some("[]"));

        store.set_read_only(false);
        store.set("people", "[\"ana\"]").unwrap();
    }
}
