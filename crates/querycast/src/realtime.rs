//! Realtime (WebSocket) manager.
//!
//! Keeps cache entries live by routing transport frames through an
//! [`UpdateStrategy`] and writing the merged value back into the cache.
//!
//! Routes are keyed by `(cache_key, topic)`. However many consumers attach
//! to a route, exactly one transport handler is installed, so one inbound
//! frame produces one merge and one write.

use crate::transport::{MessageHandler, RealtimeTransport, TopicSubscription};
use querycast_core::strategy::apply;
use querycast_core::{CacheManager, CacheProfile, RealtimeMessage, UpdateStrategy};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Lifecycle of a `(cache_key, topic)` route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No route
    Unsubscribed,
    /// Transport subscription being installed
    Subscribing,
    /// Receiving frames
    Subscribed,
    /// Transport subscription being removed
    Unsubscribing,
}

/// Identifies one `setup_listeners` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type RouteKey = (String, String);

struct Route {
    subscription: Option<TopicSubscription>,
    strategy: UpdateStrategy,
    cache_time_ms: u64,
    consumers: usize,
    state: SubscriptionState,
}

struct Inner {
    cache: Rc<CacheManager>,
    transport: Rc<dyn RealtimeTransport>,
    identity_field: String,
    routes: RefCell<HashMap<RouteKey, Route>>,
    registrations: RefCell<HashMap<ListenerId, Vec<RouteKey>>>,
    next_id: Cell<u64>,
}

/// Subscribes cache keys to realtime topics.
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Rc<Inner>,
}

/// Registration returned by [`RealtimeManager::setup_listeners`].
///
/// Dropping it removes exactly the listeners it installed or joined.
#[must_use = "dropping the guard removes the listeners"]
#[derive(Debug)]
pub struct ListenerGuard {
    manager: Weak<Inner>,
    id: ListenerId,
}

impl ListenerGuard {
    /// Registration id.
    pub const fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.remove_listeners(self.id);
        }
    }
}

impl RealtimeManager {
    /// Create a manager writing into `cache`.
    pub fn new(
        cache: Rc<CacheManager>,
        transport: Rc<dyn RealtimeTransport>,
        identity_field: impl Into<String>,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                cache,
                transport,
                identity_field: identity_field.into(),
                routes: RefCell::new(HashMap::new()),
                registrations: RefCell::new(HashMap::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// Keep `cache_key` live from `topics`.
    ///
    /// Merged values are written with `profile.cache_time_ms` as TTL. A route
    /// that already exists is joined rather than subscribed again, and keeps
    /// the strategy it was created with.
    pub fn setup_listeners<I, S>(
        &self,
        cache_key: &str,
        topics: I,
        strategy: UpdateStrategy,
        profile: &CacheProfile,
    ) -> ListenerGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id = ListenerId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);

        let mut joined: Vec<RouteKey> = Vec::new();
        for topic in topics {
            let key = (cache_key.to_string(), topic.as_ref().to_string());
            if joined.contains(&key) {
                continue;
            }
            self.join_route(&key, strategy, profile.cache_time_ms);
            joined.push(key);
        }

        self.inner.registrations.borrow_mut().insert(id, joined);
        ListenerGuard {
            manager: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Remove a registration. Returns `false` if it was already removed.
    pub fn remove_listeners(&self, id: ListenerId) -> bool {
        self.inner.remove_listeners(id)
    }

    /// State of the `(cache_key, topic)` route.
    pub fn state(&self, cache_key: &str, topic: &str) -> SubscriptionState {
        self.inner
            .routes
            .borrow()
            .get(&(cache_key.to_string(), topic.to_string()))
            .map_or(SubscriptionState::Unsubscribed, |r| r.state)
    }

    /// Consumers attached to the `(cache_key, topic)` route.
    pub fn consumer_count(&self, cache_key: &str, topic: &str) -> usize {
        self.inner
            .routes
            .borrow()
            .get(&(cache_key.to_string(), topic.to_string()))
            .map_or(0, |r| r.consumers)
    }

    /// Number of live routes.
    pub fn route_count(&self) -> usize {
        self.inner.routes.borrow().len()
    }

    /// Publish a frame on `topic`.
    pub fn emit(&self, topic: &str, frame: &Value) {
        tracing::debug!(topic, "realtime emit");
        self.inner.transport.publish(topic, frame);
    }

    /// Field identifying list elements.
    pub fn identity_field(&self) -> &str {
        &self.inner.identity_field
    }

    /// Cache this manager writes into.
    pub fn cache(&self) -> &Rc<CacheManager> {
        &self.inner.cache
    }

    fn join_route(&self, key: &RouteKey, strategy: UpdateStrategy, cache_time_ms: u64) {
        if let Some(route) = self.inner.routes.borrow_mut().get_mut(key) {
            route.consumers += 1;
            if route.strategy != strategy {
                tracing::debug!(
                    key = %key.0,
                    topic = %key.1,
                    route = %route.strategy,
                    requested = %strategy,
                    "route exists, keeping its strategy"
                );
            }
            return;
        }

        self.inner.routes.borrow_mut().insert(
            key.clone(),
            Route {
                subscription: None,
                strategy,
                cache_time_ms,
                consumers: 1,
                state: SubscriptionState::Subscribing,
            },
        );

        let weak = Rc::downgrade(&self.inner);
        let route_key = key.clone();
        let handler: MessageHandler = Rc::new(move |frame: &Value| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_frame(&route_key, frame);
            }
        });
        let subscription = self.inner.transport.subscribe(&key.1, handler);

        if let Some(route) = self.inner.routes.borrow_mut().get_mut(key) {
            route.subscription = Some(subscription);
            route.state = SubscriptionState::Subscribed;
            tracing::debug!(key = %key.0, topic = %key.1, "route subscribed");
        }
    }
}

impl Inner {
    fn handle_frame(&self, key: &RouteKey, frame: &Value) {
        let Some((route_strategy, cache_time_ms)) = self
            .routes
            .borrow()
            .get(key)
            .filter(|r| r.state == SubscriptionState::Subscribed)
            .map(|r| (r.strategy, r.cache_time_ms))
        else {
            return;
        };

        let (cache_key, topic) = (&key.0, &key.1);
        let message = RealtimeMessage::from_value(frame);
        let strategy = message.strategy().unwrap_or(route_strategy);
        let existing = self.cache.get_value(cache_key);

        match apply(strategy, existing.as_ref(), &message, &self.identity_field) {
            Ok(Some(merged)) => {
                tracing::trace!(key = %cache_key, topic = %topic, %strategy, "realtime merge");
                self.cache.set_value(cache_key.clone(), merged, Some(cache_time_ms));
            }
            Ok(None) => {
                tracing::trace!(key = %cache_key, topic = %topic, %strategy, "realtime merge, nothing to write");
            }
            Err(err) => {
                tracing::warn!(key = %cache_key, topic = %topic, error = %err, "realtime merge failed, entry left untouched");
            }
        }
    }

    fn remove_listeners(&self, id: ListenerId) -> bool {
        let Some(keys) = self.registrations.borrow_mut().remove(&id) else {
            return false;
        };

        for key in keys {
            let released = {
                let mut routes = self.routes.borrow_mut();
                match routes.get_mut(&key) {
                    Some(route) if route.consumers > 1 => {
                        route.consumers -= 1;
                        None
                    }
                    Some(route) => {
                        route.state = SubscriptionState::Unsubscribing;
                        Some(route.subscription.take())
                    }
                    None => None,
                }
            };

            if let Some(subscription) = released {
                if let Some(subscription) = subscription {
                    self.transport.unsubscribe(&subscription);
                }
                self.routes.borrow_mut().remove(&key);
                tracing::debug!(key = %key.0, topic = %key.1, "route unsubscribed");
            }
        }
        true
    }
}

impl std::fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("routes", &self.route_count())
            .field("identity_field", &self.inner.identity_field)
            .finish_non_exhaustive()
    }
}
