//! Core data plumbing for Querycast.
//!
//! This crate is framework- and runtime-agnostic:
//! - Time: [`Clock`] and [`Timer`] with deterministic [`ManualClock`] / [`ManualTimer`]
//! - Caching: [`CacheManager`] over private storage, [`CacheStatistics`] and [`CleanupManager`]
//! - Keys: [`generate_key`] canonicalization
//! - Policy: [`CacheProfile`] tables per [`Environment`], loaded via [`QueryConfig`]
//! - Realtime: [`RealtimeMessage`] envelope and [`UpdateStrategy`] merges

mod cleanup;
mod clock;
mod config;
mod error;
mod key;
mod manager;
mod profile;
mod stats;
mod storage;
pub mod strategy;
mod timer;

pub use cleanup::{CleanupManager, CleanupRoutine};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueryConfig, DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_IDENTITY_FIELD};
pub use error::{CacheError, MergeError, Result};
pub use key::{canonical_json, generate_key, key_from_parts, KEY_DELIMITER};
pub use manager::{
    CacheEvent, CacheListener, CacheManager, ListenerId, PinGuard, DEFAULT_CACHE_TIME_MS,
};
pub use profile::{CacheProfile, Environment, ProfileOverride, ProfileTable, StrategyName};
pub use stats::{CacheStatistics, StatsSnapshot};
pub use storage::CacheEntry;
pub use strategy::{RealtimeMessage, UpdateStrategy};
pub use timer::{ManualTimer, Timer, TimerCallback, TimerHandle};
