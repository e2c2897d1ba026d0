//! Cache manager: the policy surface over storage, statistics and cleanup.
//!
//! All methods are synchronous. The manager is meant to be shared as an
//! `Rc<CacheManager>` within one event loop; interior mutability keeps the
//! API `&self`. No storage borrow is held while change listeners run, so a
//! listener may freely read or write the cache.

use crate::cleanup::{CleanupManager, CleanupRoutine};
use crate::clock::Clock;
use crate::error::Result;
use crate::key;
use crate::stats::{CacheStatistics, StatsSnapshot};
use crate::storage::{CacheEntry, CacheStorage};
use crate::timer::Timer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Default retention for entries written without a TTL (5 minutes).
pub const DEFAULT_CACHE_TIME_MS: u64 = 5 * 60 * 1000;

/// Change notification emitted after a storage mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Entry was written
    Updated(String),
    /// Entry was explicitly invalidated
    Invalidated(String),
    /// Entry was removed by the cleanup sweep
    Evicted(String),
    /// Cache was cleared
    Cleared,
}

impl CacheEvent {
    /// Key this event concerns, `None` for [`CacheEvent::Cleared`].
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Updated(k) | Self::Invalidated(k) | Self::Evicted(k) => Some(k),
            Self::Cleared => None,
        }
    }

    /// Whether this event affects `key`.
    #[must_use]
    pub fn affects(&self, key: &str) -> bool {
        self.key().map_or(true, |k| k == key)
    }
}

/// Callback for cache events.
pub type CacheListener = Rc<dyn Fn(&CacheEvent)>;

/// Registration handle for a cache listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type PinTable = Rc<RefCell<HashMap<String, usize>>>;

/// Keeps a key out of the eviction sweep while alive.
#[derive(Debug)]
pub struct PinGuard {
    pinned: PinTable,
    key: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pinned = self.pinned.borrow_mut();
        if let Some(count) = pinned.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&self.key);
            }
        }
    }
}

/// Staleness, TTL and invalidation policy over the cache storage.
pub struct CacheManager {
    storage: RefCell<CacheStorage>,
    stats: CacheStatistics,
    cleanup: RefCell<CleanupManager>,
    clock: Rc<dyn Clock>,
    default_cache_time_ms: u64,
    listeners: RefCell<Vec<(ListenerId, CacheListener)>>,
    next_listener: Cell<u64>,
    pinned: PinTable,
}

impl CacheManager {
    /// Create an empty cache.
    pub fn new(clock: Rc<dyn Clock>, timer: Rc<dyn Timer>) -> Self {
        Self {
            storage: RefCell::new(CacheStorage::new()),
            stats: CacheStatistics::new(),
            cleanup: RefCell::new(CleanupManager::new(timer)),
            clock,
            default_cache_time_ms: DEFAULT_CACHE_TIME_MS,
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(0),
            pinned: Rc::default(),
        }
    }

    /// Set the retention applied to entries written without a TTL.
    #[must_use]
    pub fn with_default_cache_time(mut self, cache_time_ms: u64) -> Self {
        self.default_cache_time_ms = cache_time_ms;
        self
    }

    /// Retention applied to entries written without a TTL.
    pub const fn default_cache_time_ms(&self) -> u64 {
        self.default_cache_time_ms
    }

    /// Current time according to the cache clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // === Reads ===

    /// Read and deserialize a value.
    ///
    /// Counts exactly one hit or miss. An entry that does not deserialize
    /// into `T` is treated as a miss and left in place.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now_ms();
        let mut storage = self.storage.borrow_mut();
        let Some(entry) = storage.get_mut(key) else {
            drop(storage);
            self.stats.record_miss();
            tracing::trace!(key, "cache miss");
            return None;
        };

        match T::deserialize(&entry.data) {
            Ok(value) => {
                entry.last_accessed = now;
                drop(storage);
                self.stats.record_hit();
                tracing::trace!(key, "cache hit");
                Some(value)
            }
            Err(err) => {
                drop(storage);
                self.stats.record_miss();
                tracing::warn!(key, error = %err, "cached entry has unexpected shape, treating as miss");
                None
            }
        }
    }

    /// Read the raw JSON value. Counts exactly one hit or miss.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_ms();
        let data = self.storage.borrow_mut().get_mut(key).map(|entry| {
            entry.last_accessed = now;
            entry.data.clone()
        });

        if data.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        data
    }

    /// Raw entry for diagnostics. Touches neither statistics nor access time.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        self.storage.borrow().get(key).cloned()
    }

    /// Whether an entry exists. Touches neither statistics nor access time.
    pub fn contains(&self, key: &str) -> bool {
        self.storage.borrow().has(key)
    }

    /// `true` if the entry is absent or at least `stale_time_ms` old.
    ///
    /// Pure: no statistics, no access tracking.
    pub fn is_stale(&self, key: &str, stale_time_ms: u64) -> bool {
        let now = self.clock.now_ms();
        self.storage
            .borrow()
            .get(key)
            .map_or(true, |entry| entry.age(now) >= stale_time_ms)
    }

    // === Writes ===

    /// Serialize and store a value with a fresh timestamp.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        data: &T,
        ttl: Option<u64>,
    ) -> Result<()> {
        let value = serde_json::to_value(data)?;
        self.set_value(key, value, ttl);
        Ok(())
    }

    /// Store a raw JSON value with a fresh timestamp.
    pub fn set_value(&self, key: impl Into<String>, data: Value, ttl: Option<u64>) {
        let key = key.into();
        let now = self.clock.now_ms();
        self.storage
            .borrow_mut()
            .set(key.clone(), CacheEntry::new(data, now, ttl));
        tracing::debug!(key = %key, ttl, "cache write");
        self.emit(&CacheEvent::Updated(key));
    }

    /// Remove an entry. The next read is a miss.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.storage.borrow_mut().delete(key);
        if removed {
            tracing::debug!(key, "cache invalidate");
            self.emit(&CacheEvent::Invalidated(key.to_string()));
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate_matching(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .storage
            .borrow()
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();

        keys.iter().filter(|k| self.invalidate(k)).count()
    }

    /// Copy of the entry, for later [`restore`](Self::restore).
    pub fn snapshot(&self, key: &str) -> Option<CacheEntry> {
        self.get_entry(key)
    }

    /// Reinstate a snapshot exactly, including its timestamps.
    ///
    /// `None` restores absence.
    pub fn restore(&self, key: &str, snapshot: Option<CacheEntry>) {
        match snapshot {
            Some(entry) => {
                self.storage.borrow_mut().set(key, entry);
                self.emit(&CacheEvent::Updated(key.to_string()));
            }
            None => {
                self.invalidate(key);
            }
        }
    }

    /// Remove every entry. Not counted as evictions.
    pub fn clear(&self) {
        self.storage.borrow_mut().clear();
        tracing::debug!("cache cleared");
        self.emit(&CacheEvent::Cleared);
    }

    // === Keys ===

    /// Canonical key for a base name and parameters.
    pub fn generate_key(base: &str, params: Option<&Value>) -> String {
        key::generate_key(base, params)
    }

    /// Key built from delimited parts.
    pub fn key_from_parts<I, S>(parts: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        key::key_from_parts(parts)
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<String> {
        self.storage.borrow().keys()
    }

    /// Copies of all stored entries.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        self.storage.borrow().entries()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.storage.borrow().size()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Statistics ===

    /// Counters plus current size.
    pub fn get_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            size: self.len(),
            ..self.stats.get_stats()
        }
    }

    /// Zero the counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    // === Eviction ===

    /// Keep `key` out of the eviction sweep until the guard drops.
    pub fn pin(&self, key: &str) -> PinGuard {
        *self
            .pinned
            .borrow_mut()
            .entry(key.to_string())
            .or_insert(0) += 1;
        PinGuard {
            pinned: self.pinned.clone(),
            key: key.to_string(),
        }
    }

    /// Whether a fetch currently pins `key`.
    pub fn is_pinned(&self, key: &str) -> bool {
        self.pinned.borrow().contains_key(key)
    }

    /// Remove entries not accessed within their retention window.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<String> = {
            let storage = self.storage.borrow();
            let pinned = self.pinned.borrow();
            storage
                .keys()
                .into_iter()
                .filter(|k| !pinned.contains_key(k))
                .filter(|k| {
                    storage
                        .get(k)
                        .is_some_and(|e| e.is_expired(now, self.default_cache_time_ms))
                })
                .collect()
        };

        // Listeners may remove keys mid-sweep; count only our own deletes.
        let mut removed = 0;
        for key in &expired {
            if self.storage.borrow_mut().delete(key) {
                removed += 1;
                self.stats.record_eviction();
                tracing::debug!(key = %key, "cache evict");
                self.emit(&CacheEvent::Evicted(key.clone()));
            }
        }
        removed
    }

    /// Run [`evict_expired`](Self::evict_expired) every `interval_ms`.
    ///
    /// `0` disables the timer; [`cleanup_expired`](Self::cleanup_expired)
    /// still works.
    pub fn start_cleanup(self: &Rc<Self>, interval_ms: u64) {
        let cache = Rc::downgrade(self);
        let routine: CleanupRoutine = Rc::new(move || {
            Ok(cache.upgrade().map_or(0, |cache| cache.evict_expired()))
        });
        self.cleanup
            .borrow_mut()
            .start_cleanup(interval_ms, routine);
    }

    /// Disarm the cleanup timer.
    pub fn stop_cleanup(&self) {
        self.cleanup.borrow_mut().stop_cleanup();
    }

    /// Run the cleanup routine once, independent of the timer.
    pub fn cleanup_expired(&self) -> Option<usize> {
        self.cleanup.borrow().cleanup_expired()
    }

    /// Whether the cleanup timer is armed.
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup.borrow().is_running()
    }

    // === Notifications ===

    /// Register a change listener.
    pub fn subscribe(&self, listener: CacheListener) -> ListenerId {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, listener));
        id
    }

    /// Remove a change listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    fn emit(&self, event: &CacheEvent) {
        let listeners: Vec<CacheListener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.len())
            .field("default_cache_time_ms", &self.default_cache_time_ms)
            .field("listeners", &self.listener_count())
            .field("cleanup", &self.cleanup.borrow())
            .finish_non_exhaustive()
    }
}
