//! Time sources for the cache layer.
//!
//! Staleness and eviction are computed from millisecond timestamps. The
//! cache never reads the system time directly; it asks a [`Clock`], so
//! tests can drive time explicitly with [`ManualClock`] and the browser
//! runtime can supply `Date.now()`.

use std::cell::Cell;
use std::rc::Rc;

/// Millisecond time source.
pub trait Clock {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time since the Unix epoch.
///
/// Not usable on `wasm32-unknown-unknown`, where the browser runtime
/// provides its own clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// Manually driven clock.
///
/// Clones share the same underlying time, so a test can hold one handle
/// while the cache holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Create a clock starting at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    /// Set the current time.
    pub fn set(&self, now_ms: u64) {
        self.now.set(now_ms);
    }

    /// Move time forward.
    pub fn advance(&self, delta_ms: u64) {
        self.now.set(self.now.get().saturating_add(delta_ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}
