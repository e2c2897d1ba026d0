use futures::future::LocalFutureObj;
use futures::task::{LocalSpawn, SpawnError};
use querycast_core::{Clock, Timer, TimerCallback, TimerHandle};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

/// `Date.now()` clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateClock;

impl Clock for DateClock {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn now_ms(&self) -> u64 {
        js_sys::Date::now() as u64
    }
}

/// `window.setInterval` timer.
///
/// Owns the callback closures; an interval's closure is released when it
/// is cleared or the timer is dropped.
#[derive(Default)]
pub struct IntervalTimer {
    next_id: Cell<u64>,
    intervals: RefCell<HashMap<TimerHandle, (i32, Closure<dyn FnMut()>)>>,
}

impl IntervalTimer {
    /// Create a timer with no intervals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed intervals.
    pub fn active_count(&self) -> usize {
        self.intervals.borrow().len()
    }
}

impl Timer for IntervalTimer {
    fn set_interval(&self, interval_ms: u64, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle(self.next_id.get());
        self.next_id.set(handle.0 + 1);

        let closure = Closure::wrap(callback);
        let Some(window) = web_sys::window() else {
            tracing::warn!("no window, interval not armed");
            return handle;
        };
        let timeout = i32::try_from(interval_ms).unwrap_or(i32::MAX);
        match window.set_interval_with_callback_and_timeout_and_arguments_0(
            closure.as_ref().unchecked_ref(),
            timeout,
        ) {
            Ok(id) => {
                self.intervals.borrow_mut().insert(handle, (id, closure));
            }
            Err(err) => tracing::warn!(error = ?err, "setInterval failed"),
        }
        handle
    }

    fn clear_interval(&self, handle: TimerHandle) {
        let Some((id, closure)) = self.intervals.borrow_mut().remove(&handle) else {
            return;
        };
        if let Some(window) = web_sys::window() {
            window.clear_interval_with_handle(id);
        }
        drop(closure);
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        let intervals = std::mem::take(&mut *self.intervals.borrow_mut());
        if let Some(window) = web_sys::window() {
            for (id, _) in intervals.values() {
                window.clear_interval_with_handle(*id);
            }
        }
    }
}

impl std::fmt::Debug for IntervalTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalTimer")
            .field("active", &self.active_count())
            .finish()
    }
}

/// Spawns onto the browser microtask queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserSpawner;

impl LocalSpawn for BrowserSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        wasm_bindgen_futures::spawn_local(future);
        Ok(())
    }
}
