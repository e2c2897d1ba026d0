//! `WebSocket`-backed realtime transport.
//!
//! Frames are JSON text. Outbound:
//!
//! ```json
//! {"type": "subscribe", "topic": "feed"}
//! {"type": "unsubscribe", "topic": "feed"}
//! {"type": "publish", "topic": "feed", "payload": {...}}
//! ```
//!
//! Inbound frames are `{"topic": .., "payload": ..}`; the payload is handed
//! to every local handler on that topic. Frames sent before the socket
//! opens are queued and flushed on open.

use crate::transport::{MessageHandler, RealtimeTransport, TopicSubscription};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{BinaryType, CloseEvent, ErrorEvent, MessageEvent, WebSocket};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebSocketError {
    /// Socket could not be created
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

type Handlers = Rc<RefCell<HashMap<String, Vec<(u64, MessageHandler)>>>>;

struct Connection {
    socket: WebSocket,
    open: Cell<bool>,
    outbox: RefCell<Vec<String>>,
}

impl Connection {
    fn send(&self, frame: &Value) {
        let text = frame.to_string();
        if !self.open.get() {
            self.outbox.borrow_mut().push(text);
            return;
        }
        if let Err(err) = self.socket.send_with_str(&text) {
            tracing::warn!(error = ?err, "websocket send failed");
        }
    }

    fn flush(&self) {
        let pending = std::mem::take(&mut *self.outbox.borrow_mut());
        for text in pending {
            if let Err(err) = self.socket.send_with_str(&text) {
                tracing::warn!(error = ?err, "websocket send failed");
            }
        }
    }
}

/// Realtime transport over one browser `WebSocket`.
pub struct WebSocketTransport {
    connection: Rc<Connection>,
    handlers: Handlers,
    next_id: Cell<u64>,
    _onopen: Closure<dyn FnMut()>,
    _onmessage: Closure<dyn FnMut(MessageEvent)>,
    _onerror: Closure<dyn FnMut(ErrorEvent)>,
    _onclose: Closure<dyn FnMut(CloseEvent)>,
}

impl WebSocketTransport {
    /// Open a socket to `url`.
    pub fn connect(url: &str) -> Result<Self, WebSocketError> {
        let socket =
            WebSocket::new(url).map_err(|e| WebSocketError::ConnectionFailed(format!("{e:?}")))?;
        socket.set_binary_type(BinaryType::Arraybuffer);
        let connection = Rc::new(Connection {
            socket,
            open: Cell::new(false),
            outbox: RefCell::new(Vec::new()),
        });
        let handlers: Handlers = Rc::default();

        let conn = connection.clone();
        let onopen = Closure::<dyn FnMut()>::new(move || {
            conn.open.set(true);
            conn.flush();
            tracing::debug!("websocket open");
        });

        let dispatch = handlers.clone();
        let onmessage = Closure::<dyn FnMut(MessageEvent)>::new(move |e: MessageEvent| {
            let Ok(text) = e.data().dyn_into::<js_sys::JsString>() else {
                tracing::trace!("ignoring binary frame");
                return;
            };
            let text: String = text.into();
            match serde_json::from_str::<Value>(&text) {
                Ok(frame) => dispatch_frame(&dispatch, &frame),
                Err(err) => tracing::warn!(error = %err, "undecodable websocket frame"),
            }
        });

        let onerror = Closure::<dyn FnMut(ErrorEvent)>::new(move |e: ErrorEvent| {
            tracing::warn!(message = %e.message(), "websocket error");
        });

        let conn = connection.clone();
        let onclose = Closure::<dyn FnMut(CloseEvent)>::new(move |e: CloseEvent| {
            conn.open.set(false);
            tracing::debug!(code = e.code(), clean = e.was_clean(), "websocket closed");
        });

        let socket = &connection.socket;
        socket.set_onopen(Some(onopen.as_ref().unchecked_ref()));
        socket.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
        socket.set_onerror(Some(onerror.as_ref().unchecked_ref()));
        socket.set_onclose(Some(onclose.as_ref().unchecked_ref()));

        Ok(Self {
            connection,
            handlers,
            next_id: Cell::new(0),
            _onopen: onopen,
            _onmessage: onmessage,
            _onerror: onerror,
            _onclose: onclose,
        })
    }

    /// Whether the socket is open.
    pub fn is_open(&self) -> bool {
        self.connection.open.get()
    }

    /// Number of local handlers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers.borrow().get(topic).map_or(0, Vec::len)
    }
}

fn dispatch_frame(handlers: &Handlers, frame: &Value) {
    let Some(topic) = frame.get("topic").and_then(Value::as_str) else {
        tracing::warn!("websocket frame without topic");
        return;
    };
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
    let targets: Vec<MessageHandler> = handlers
        .borrow()
        .get(topic)
        .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default();
    for handler in targets {
        handler(&payload);
    }
}

impl RealtimeTransport for WebSocketTransport {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> TopicSubscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let first = {
            let mut handlers = self.handlers.borrow_mut();
            let entry = handlers.entry(topic.to_string()).or_default();
            entry.push((id, handler));
            entry.len() == 1
        };
        if first {
            self.connection
                .send(&json!({ "type": "subscribe", "topic": topic }));
        }
        TopicSubscription {
            topic: topic.to_string(),
            id,
        }
    }

    fn unsubscribe(&self, subscription: &TopicSubscription) {
        let last = {
            let mut handlers = self.handlers.borrow_mut();
            let Some(entry) = handlers.get_mut(&subscription.topic) else {
                return;
            };
            entry.retain(|(id, _)| *id != subscription.id);
            let empty = entry.is_empty();
            if empty {
                handlers.remove(&subscription.topic);
            }
            empty
        };
        if last {
            self.connection
                .send(&json!({ "type": "unsubscribe", "topic": subscription.topic }));
        }
    }

    fn publish(&self, topic: &str, frame: &Value) {
        self.connection
            .send(&json!({ "type": "publish", "topic": topic, "payload": frame }));
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        let socket = &self.connection.socket;
        socket.set_onopen(None);
        socket.set_onmessage(None);
        socket.set_onerror(None);
        socket.set_onclose(None);
        let _ = socket.close();
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.connection.socket.url())
            .field("open", &self.is_open())
            .field("topics", &self.handlers.borrow().len())
            .finish_non_exhaustive()
    }
}
