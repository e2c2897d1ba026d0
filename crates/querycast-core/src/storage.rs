//! Key/value storage for cache entries.
//!
//! Pure map semantics: no TTL awareness and no statistics. Only the
//! [`CacheManager`](crate::CacheManager) holds a `CacheStorage`, and it
//! hands out clones of entries, never references into the map.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A cached value with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cached payload
    pub data: Value,
    /// When the entry was written (ms)
    pub timestamp: u64,
    /// Retention override in milliseconds
    pub ttl: Option<u64>,
    /// When the entry was last read or written (ms)
    pub last_accessed: u64,
}

impl CacheEntry {
    /// Create an entry written at `now`.
    #[must_use]
    pub fn new(data: Value, now: u64, ttl: Option<u64>) -> Self {
        Self {
            data,
            timestamp: now,
            ttl,
            last_accessed: now,
        }
    }

    /// Milliseconds since the entry was written.
    #[must_use]
    pub const fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    /// Time at which the entry becomes stale under `stale_time_ms`.
    #[must_use]
    pub const fn stale_after(&self, stale_time_ms: u64) -> u64 {
        self.timestamp.saturating_add(stale_time_ms)
    }

    /// Whether the retention window has elapsed since the last access.
    #[must_use]
    pub fn is_expired(&self, now: u64, default_ttl: u64) -> bool {
        now.saturating_sub(self.last_accessed) >= self.ttl.unwrap_or(default_ttl)
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheStorage {
    entries: HashMap<String, CacheEntry>,
}

impl CacheStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub(crate) fn set(&mut self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub(crate) fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn size(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn entries(&self) -> Vec<(String, CacheEntry)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_json_shape() {
        let mut entry = CacheEntry::new(json!({"likes": 1}), 100, Some(5_000));
        entry.last_accessed = 250;

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            json!({"data": {"likes": 1}, "timestamp": 100, "ttl": 5_000, "lastAccessed": 250})
        );

        let absent: CacheEntry =
            serde_json::from_value(json!({"data": null, "timestamp": 0, "ttl": null, "lastAccessed": 0}))
                .unwrap();
        assert_eq!(absent.ttl, None);
    }

    #[test]
    fn test_storage_set_get() {
        let mut storage = CacheStorage::new();
        storage.set("a", CacheEntry::new(json!(1), 10, None));

        assert!(storage.has("a"));
        assert_eq!(storage.get("a").map(|e| &e.data), Some(&json!(1)));
        assert_eq!(storage.size(), 1);
    }

    #[test]
    fn test_storage_delete() {
        let mut storage = CacheStorage::new();
        storage.set("a", CacheEntry::new(json!(1), 0, None));

        assert!(storage.delete("a"));
        assert!(!storage.delete("a"));
        assert!(!storage.has("a"));
    }

    #[test]
    fn test_storage_overwrite_keeps_one_slot() {
        let mut storage = CacheStorage::new();
        storage.set("a", CacheEntry::new(json!(1), 0, None));
        storage.set("a", CacheEntry::new(json!(2), 5, None));

        assert_eq!(storage.size(), 1);
        assert_eq!(storage.get("a").map(|e| e.timestamp), Some(5));
    }

    #[test]
    fn test_storage_keys_and_entries() {
        let mut storage = CacheStorage::new();
        storage.set("a", CacheEntry::new(json!("x"), 0, None));
        storage.set("b", CacheEntry::new(json!("y"), 0, Some(10)));

        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        let entries = storage.entries();
        assert_eq!(entries.len(), 2);

        storage.clear();
        assert_eq!(storage.size(), 0);
    }

    #[test]
    fn test_entry_age_and_staleness() {
        let entry = CacheEntry::new(json!(null), 1_000, None);
        assert_eq!(entry.age(1_500), 500);
        assert_eq!(entry.age(500), 0);
        assert_eq!(entry.stale_after(250), 1_250);
    }

    #[test]
    fn test_entry_expiry_uses_last_access() {
        let mut entry = CacheEntry::new(json!(null), 0, Some(100));
        assert!(!entry.is_expired(99, 1_000));
        assert!(entry.is_expired(100, 1_000));

        entry.last_accessed = 80;
        assert!(!entry.is_expired(100, 1_000));

        let default_ttl = CacheEntry::new(json!(null), 0, None);
        assert!(default_ttl.is_expired(1_000, 1_000));
    }
}
