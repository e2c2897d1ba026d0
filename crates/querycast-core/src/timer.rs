//! Repeating timers.
//!
//! The cleanup sweep and background polling both need "call me every N
//! milliseconds". The [`Timer`] trait abstracts over the host: the browser
//! runtime maps it onto `setInterval`, and [`ManualTimer`] fires intervals
//! deterministically as a test advances virtual time.

use crate::clock::ManualClock;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Callback invoked each time an interval elapses.
pub type TimerCallback = Box<dyn FnMut()>;

/// Handle identifying an armed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Host timer capable of repeating intervals.
pub trait Timer {
    /// Arm a repeating interval.
    fn set_interval(&self, interval_ms: u64, callback: TimerCallback) -> TimerHandle;

    /// Disarm an interval. Unknown handles are ignored.
    fn clear_interval(&self, handle: TimerHandle);
}

struct Interval {
    period_ms: u64,
    next_fire: u64,
    /// Taken out while the callback runs.
    callback: Option<TimerCallback>,
}

#[derive(Default)]
struct ManualTimerState {
    next_id: u64,
    intervals: BTreeMap<TimerHandle, Interval>,
}

/// Virtual timer driven by [`ManualTimer::advance`].
///
/// When linked to a [`ManualClock`], the clock is moved to each fire time
/// before the callback runs, so callbacks observe the time at which they
/// were due.
#[derive(Clone, Default)]
pub struct ManualTimer {
    now: Rc<Cell<u64>>,
    clock: Option<ManualClock>,
    state: Rc<RefCell<ManualTimerState>>,
}

impl ManualTimer {
    /// Create an unlinked timer starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a timer that keeps `clock` in step.
    #[must_use]
    pub fn with_clock(clock: ManualClock) -> Self {
        use crate::clock::Clock;
        Self {
            now: Rc::new(Cell::new(clock.now_ms())),
            clock: Some(clock),
            state: Rc::default(),
        }
    }

    /// Current virtual time.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.now.get()
    }

    /// Number of armed intervals.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.borrow().intervals.len()
    }

    /// Advance virtual time, firing every interval that falls due in order.
    pub fn advance(&self, delta_ms: u64) {
        let target = self.now.get().saturating_add(delta_ms);

        while let Some((handle, fire_at)) = self.next_due(target) {
            self.move_to(fire_at);

            let callback = self
                .state
                .borrow_mut()
                .intervals
                .get_mut(&handle)
                .and_then(|i| i.callback.take());
            let Some(mut callback) = callback else {
                continue;
            };

            callback();

            // The callback may have cleared its own interval.
            let mut state = self.state.borrow_mut();
            if let Some(interval) = state.intervals.get_mut(&handle) {
                interval.next_fire = fire_at.saturating_add(interval.period_ms);
                interval.callback = Some(callback);
            }
        }

        self.move_to(target);
    }

    fn next_due(&self, target: u64) -> Option<(TimerHandle, u64)> {
        self.state
            .borrow()
            .intervals
            .iter()
            .filter(|(_, i)| i.callback.is_some() && i.next_fire <= target)
            .min_by_key(|(handle, i)| (i.next_fire, **handle))
            .map(|(handle, i)| (*handle, i.next_fire))
    }

    fn move_to(&self, now: u64) {
        self.now.set(now);
        if let Some(clock) = &self.clock {
            clock.set(now);
        }
    }
}

impl Timer for ManualTimer {
    fn set_interval(&self, interval_ms: u64, callback: TimerCallback) -> TimerHandle {
        let period_ms = interval_ms.max(1);
        let mut state = self.state.borrow_mut();
        let handle = TimerHandle(state.next_id);
        state.next_id += 1;
        state.intervals.insert(
            handle,
            Interval {
                period_ms,
                next_fire: self.now.get().saturating_add(period_ms),
                callback: Some(callback),
            },
        );
        handle
    }

    fn clear_interval(&self, handle: TimerHandle) {
        self.state.borrow_mut().intervals.remove(&handle);
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTimer")
            .field("now", &self.now.get())
            .field("active", &self.active_count())
            .finish()
    }
}
