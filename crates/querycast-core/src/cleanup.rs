//! Periodic cleanup sweep.
//!
//! The cleanup manager owns at most one repeating timer. Each tick invokes
//! a caller-supplied routine (normally "evict everything whose retention
//! window elapsed"). A failing routine is logged and the timer keeps
//! running.

use crate::error::Result;
use crate::timer::{Timer, TimerHandle};
use std::rc::Rc;

/// Cleanup routine returning the number of entries it removed.
pub type CleanupRoutine = Rc<dyn Fn() -> Result<usize>>;

/// Drives a cleanup routine on a timer.
pub struct CleanupManager {
    timer: Rc<dyn Timer>,
    handle: Option<TimerHandle>,
    routine: Option<CleanupRoutine>,
    interval_ms: u64,
}

impl CleanupManager {
    /// Create a stopped cleanup manager.
    pub fn new(timer: Rc<dyn Timer>) -> Self {
        Self {
            timer,
            handle: None,
            routine: None,
            interval_ms: 0,
        }
    }

    /// Arm the sweep.
    ///
    /// Any previously armed timer is stopped first. With `interval_ms == 0`
    /// no timer is armed and cleanup only runs through
    /// [`cleanup_expired`](Self::cleanup_expired).
    pub fn start_cleanup(&mut self, interval_ms: u64, routine: CleanupRoutine) {
        self.stop_cleanup();
        self.routine = Some(routine.clone());
        self.interval_ms = interval_ms;

        if interval_ms == 0 {
            tracing::debug!("cleanup timer disabled, sweep is manual");
            return;
        }

        let handle = self.timer.set_interval(
            interval_ms,
            Box::new(move || {
                run_routine(&routine);
            }),
        );
        self.handle = Some(handle);
        tracing::debug!(interval_ms, "cleanup timer armed");
    }

    /// Disarm the timer. The routine stays configured for manual runs.
    pub fn stop_cleanup(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.timer.clear_interval(handle);
            tracing::debug!("cleanup timer stopped");
        }
    }

    /// Run the configured routine once.
    ///
    /// Returns the number of removed entries, or `None` when no routine is
    /// configured or the routine failed.
    pub fn cleanup_expired(&self) -> Option<usize> {
        self.routine.as_ref().and_then(run_routine)
    }

    /// Whether a timer is armed.
    pub const fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Interval of the last `start_cleanup` call.
    pub const fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}

impl std::fmt::Debug for CleanupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupManager")
            .field("running", &self.is_running())
            .field("interval_ms", &self.interval_ms)
            .finish_non_exhaustive()
    }
}

fn run_routine(routine: &CleanupRoutine) -> Option<usize> {
    match routine() {
        Ok(removed) => {
            tracing::debug!(removed, "cleanup sweep finished");
            Some(removed)
        }
        Err(err) => {
            tracing::warn!(error = %err, "cleanup sweep failed");
            None
        }
    }
}
