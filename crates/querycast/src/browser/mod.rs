//! Browser runtime.
//!
//! Host implementations of the clock, timer, spawner and realtime
//! transport seams for `wasm32` targets.

mod runtime;
mod websocket;

pub use runtime::{BrowserSpawner, DateClock, IntervalTimer};
pub use websocket::{WebSocketError, WebSocketTransport};
