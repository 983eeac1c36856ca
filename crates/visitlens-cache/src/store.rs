//! Key-value cache stores
//!
//! The cache manager treats its store as an opaque collaborator: byte values
//! under string keys with an optional TTL. [`MemoryCacheStore`] is the
//! in-process implementation; a deployment backed by an external store
//! implements [`CacheStore`] over its client.

use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Byte-valued key-value store with expiry
pub trait CacheStore: Send + Sync {
    /// Get a live value
    fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>>;

    /// Store a value, replacing any previous one. `None` never expires.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove a value. Returns true if a live value was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Live keys starting with `prefix`, sorted
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: Arc<[u8]>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory store on a concurrent map
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, expired ones included until they are touched
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired value. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "expired cache values purged");
        }
        purged
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>> {
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(Arc::clone(&entry.data))),
            Some(_) => true,
            None => false,
        };
        // The read guard is released before removing
        if hit {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let stored = StoredValue {
            data: value.into(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(key.to_string(), stored);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, v)| !v.is_expired(now)))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemoryCacheStore::new();
        store.set("a:1", b"one".to_vec(), None).unwrap();
        assert_eq!(store.get("a:1").unwrap().as_deref(), Some(&b"one"[..]));
        assert!(store.delete("a:1").unwrap());
        assert!(!store.delete("a:1").unwrap());
        assert_eq!(store.get("a:1").unwrap(), None);
    }

    #[test]
    fn test_set_replaces() {
        let store = MemoryCacheStore::new();
        store.set("k", b"old".to_vec(), None).unwrap();
        store.set("k", b"new".to_vec(), None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"new"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_values_are_misses() {
        let store = MemoryCacheStore::new();
        store.set("k", b"v".to_vec(), Some(Duration::ZERO)).unwrap();
        store.set("live", b"v".to_vec(), Some(Duration::from_secs(3600))).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.keys_with_prefix("").unwrap(), vec!["live".to_string()]);
        assert_eq!(store.purge_expired(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryCacheStore::new();
        store.set("a", b"v".to_vec(), Some(Duration::ZERO)).unwrap();
        store.set("b", b"v".to_vec(), Some(Duration::ZERO)).unwrap();
        store.set("c", b"v".to_vec(), None).unwrap();
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_keys_with_prefix_sorted() {
        let store = MemoryCacheStore::new();
        for key in ["p:b", "q:a", "p:a", "p:c"] {
            store.set(key, Vec::new(), None).unwrap();
        }
        assert_eq!(
            store.keys_with_prefix("p:").unwrap(),
            vec!["p:a".to_string(), "p:b".to_string(), "p:c".to_string()]
        );
    }
}
