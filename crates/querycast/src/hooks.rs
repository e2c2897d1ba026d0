//! Hook adapters for UI trees.
//!
//! A hook is mounted by constructing it and unmounted by dropping it. It
//! owns no cache state: data is read from and written to the shared
//! [`CacheManager`](querycast_core::CacheManager), so two hooks on the same
//! key observe the same entry. Hooks follow the cache through its change
//! events and report their own state changes through `on_change`
//! callbacks, which is where a UI framework hooks in its re-render.
//!
//! Unmounting removes the hook's cache listener, realtime listeners and
//! polling timer. A fetch the hook started keeps running and still updates
//! the shared entry.

use crate::error::{QueryError, Result};
use crate::executor::{
    InfiniteData, MutationOptions, PageDirection, PageResponse, QueryExecutor, QueryOptions,
    QueryOutcome,
};
use crate::realtime::ListenerGuard;
use futures::future::LocalBoxFuture;
use futures::task::{LocalSpawn, LocalSpawnExt};
use querycast_core::{CacheEvent, CacheListener, ListenerId, Timer, TimerHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

/// Query fetcher.
pub type Fetcher<T> = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<T>>>;

/// Infinite-query page fetcher.
pub type PageFetcher<T> = Rc<dyn Fn(Value) -> LocalBoxFuture<'static, Result<PageResponse<T>>>>;

/// Mutation function.
pub type MutateFn<V, T> = Rc<dyn Fn(V) -> LocalBoxFuture<'static, Result<T>>>;

/// Callback run after a hook's state changed.
pub type ChangeCallback = Rc<dyn Fn()>;

/// Lifecycle of a query as seen by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Not fetched (disabled)
    Idle,
    /// First fetch outstanding, no data yet
    Loading,
    /// Data available
    Success,
    /// Last fetch failed
    Error,
}

/// Runtime pieces shared by every hook of a client.
#[derive(Clone)]
pub struct HookContext {
    /// Executor all hooks go through
    pub executor: QueryExecutor,
    /// Spawner for background fetches
    pub spawner: Rc<dyn LocalSpawn>,
    /// Timer for polling
    pub timer: Rc<dyn Timer>,
}

impl std::fmt::Debug for HookContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Subscribers(RefCell<Vec<ChangeCallback>>);

impl Subscribers {
    fn push(&self, callback: ChangeCallback) {
        self.0.borrow_mut().push(callback);
    }

    fn notify(&self) {
        let callbacks: Vec<ChangeCallback> = self.0.borrow().clone();
        for callback in callbacks {
            callback();
        }
    }
}

/// Cache listener calling back into a hook while it is alive.
fn watch_key<S: 'static>(
    hook: &Rc<S>,
    key: String,
    on_updated: fn(&Rc<S>),
    on_removed: fn(&Rc<S>),
) -> CacheListener {
    let weak: Weak<S> = Rc::downgrade(hook);
    Rc::new(move |event: &CacheEvent| {
        let Some(hook) = weak.upgrade() else {
            return;
        };
        if !event.affects(&key) {
            return;
        }
        match event {
            CacheEvent::Updated(_) => on_updated(&hook),
            CacheEvent::Invalidated(_) | CacheEvent::Cleared => on_removed(&hook),
            CacheEvent::Evicted(_) => {}
        }
    })
}

// === Query ===

struct QueryState<T> {
    data: Option<T>,
    status: QueryStatus,
    error: Option<QueryError>,
    fetching: bool,
    listeners: Option<ListenerGuard>,
}

struct QueryShared<T> {
    ctx: HookContext,
    key: String,
    options: QueryOptions,
    fetcher: Fetcher<T>,
    state: RefCell<QueryState<T>>,
    subscribers: Subscribers,
    mounted: Cell<bool>,
}

/// `{ data, isLoading, isError, error, refetch }` over one cache key.
pub struct QueryHook<T: Serialize + DeserializeOwned + Clone + 'static> {
    shared: Rc<QueryShared<T>>,
    cache_listener: ListenerId,
    poll: Option<TimerHandle>,
}

impl<T> QueryShared<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    fn start(self: &Rc<Self>, force: bool) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.fetching {
                return Ok(());
            }
            state.fetching = true;
            if state.data.is_none() {
                state.status = QueryStatus::Loading;
            }
        }
        self.subscribers.notify();

        let this = self.clone();
        let spawned = self
            .ctx
            .spawner
            .spawn_local(async move { this.run(force).await });
        spawned.map_err(|err| {
            let err = QueryError::from(err);
            self.finish(Err(err.clone()));
            err
        })
    }

    async fn run(&self, force: bool) {
        let fetcher = self.fetcher.clone();
        let executor = &self.ctx.executor;
        let result = if force {
            executor
                .refetch_query(&self.key, move || fetcher(), &self.options)
                .await
        } else {
            executor
                .execute_query(&self.key, move || fetcher(), &self.options)
                .await
        };
        self.finish(result);
    }

    fn finish(&self, result: Result<QueryOutcome<T>>) {
        let released = {
            let mut state = self.state.borrow_mut();
            state.fetching = false;
            match result {
                Ok(outcome) => {
                    state.data = Some(outcome.data);
                    state.status = QueryStatus::Success;
                    state.error = None;
                    if self.mounted.get() {
                        std::mem::replace(&mut state.listeners, outcome.listeners)
                    } else {
                        outcome.listeners
                    }
                }
                Err(err) => {
                    tracing::debug!(key = %self.key, error = %err, "query failed");
                    state.status = QueryStatus::Error;
                    state.error = Some(err);
                    None
                }
            }
        };
        drop(released);
        self.subscribers.notify();
    }

    fn sync_from_cache(self: &Rc<Self>) {
        let Some(entry) = self.ctx.executor.cache().get_entry(&self.key) else {
            return;
        };
        match serde_json::from_value::<T>(entry.data) {
            Ok(data) => {
                {
                    let mut state = self.state.borrow_mut();
                    state.data = Some(data);
                    state.status = QueryStatus::Success;
                    state.error = None;
                }
                self.subscribers.notify();
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "cached value has unexpected shape");
            }
        }
    }

    fn refetch_after_removal(self: &Rc<Self>) {
        if !self.mounted.get() || !self.options.enabled {
            return;
        }
        if let Err(err) = self.start(true) {
            tracing::warn!(key = %self.key, error = %err, "refetch after invalidation failed");
        }
    }
}

impl<T> QueryHook<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    /// Mount a query hook.
    ///
    /// Starts the initial fetch when `options.enabled`, and arms polling when
    /// the resolved profile has a refetch interval.
    pub fn mount(
        ctx: HookContext,
        key: impl Into<String>,
        fetcher: Fetcher<T>,
        options: QueryOptions,
    ) -> Self {
        let key = key.into();
        let profile = options.resolve(ctx.executor.profiles());
        let shared = Rc::new(QueryShared {
            ctx: ctx.clone(),
            key: key.clone(),
            options,
            fetcher,
            state: RefCell::new(QueryState {
                data: None,
                status: QueryStatus::Idle,
                error: None,
                fetching: false,
                listeners: None,
            }),
            subscribers: Subscribers::default(),
            mounted: Cell::new(true),
        });

        let cache_listener = ctx.executor.cache().subscribe(watch_key(
            &shared,
            key,
            QueryShared::sync_from_cache,
            QueryShared::refetch_after_removal,
        ));

        let poll = profile
            .refetch_interval_ms
            .filter(|ms| *ms > 0 && shared.options.enabled)
            .map(|ms| {
                let weak = Rc::downgrade(&shared);
                ctx.timer.set_interval(
                    ms,
                    Box::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            if let Err(err) = shared.start(true) {
                                tracing::warn!(key = %shared.key, error = %err, "polling refetch failed");
                            }
                        }
                    }),
                )
            });

        if shared.options.enabled {
            if let Err(err) = shared.start(false) {
                tracing::warn!(key = %shared.key, error = %err, "initial fetch could not start");
            }
        }

        Self {
            shared,
            cache_listener,
            poll,
        }
    }

    /// Cache key.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Latest data.
    pub fn data(&self) -> Option<T> {
        self.shared.state.borrow().data.clone()
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.shared.state.borrow().status
    }

    /// First fetch outstanding, no data yet.
    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Loading
    }

    /// Any fetch outstanding.
    pub fn is_fetching(&self) -> bool {
        self.shared.state.borrow().fetching
    }

    /// Last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    /// Error of the last fetch.
    pub fn error(&self) -> Option<QueryError> {
        self.shared.state.borrow().error.clone()
    }

    /// Fetch regardless of freshness.
    pub fn refetch(&self) -> Result<()> {
        self.shared.start(true)
    }

    /// Run `callback` after every state change.
    pub fn on_change(&self, callback: impl Fn() + 'static) {
        self.shared.subscribers.push(Rc::new(callback));
    }
}

impl<T> Drop for QueryHook<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.mounted.set(false);
        shared.ctx.executor.cache().unsubscribe(self.cache_listener);
        if let Some(handle) = self.poll.take() {
            shared.ctx.timer.clear_interval(handle);
        }
        let listeners = shared.state.borrow_mut().listeners.take();
        drop(listeners);
        tracing::trace!(key = %shared.key, "query hook unmounted");
    }
}

impl<T> std::fmt::Debug for QueryHook<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHook")
            .field("key", &self.shared.key)
            .field("status", &self.status())
            .field("fetching", &self.is_fetching())
            .finish_non_exhaustive()
    }
}

// === Mutation ===

struct MutationState<T> {
    data: Option<T>,
    error: Option<QueryError>,
    pending: usize,
}

struct MutationShared<V, T> {
    ctx: HookContext,
    mutate_fn: MutateFn<V, T>,
    options: MutationOptions<V>,
    state: RefCell<MutationState<T>>,
    subscribers: Subscribers,
}

/// `{ mutate, isPending, data, error }`.
pub struct MutationHook<V, T> {
    shared: Rc<MutationShared<V, T>>,
}

impl<V, T> MutationHook<V, T>
where
    V: 'static,
    T: Serialize + Clone + 'static,
{
    /// Create a mutation hook.
    pub fn new(ctx: HookContext, mutate_fn: MutateFn<V, T>, options: MutationOptions<V>) -> Self {
        Self {
            shared: Rc::new(MutationShared {
                ctx,
                mutate_fn,
                options,
                state: RefCell::new(MutationState {
                    data: None,
                    error: None,
                    pending: 0,
                }),
                subscribers: Subscribers::default(),
            }),
        }
    }

    /// Run the mutation and return its result.
    ///
    /// The optimistic update, if configured, is applied immediately.
    pub fn mutate_async(&self, variables: V) -> impl Future<Output = Result<T>> + 'static {
        {
            let mut state = self.shared.state.borrow_mut();
            state.pending += 1;
            state.error = None;
        }
        self.shared.subscribers.notify();

        let mutate_fn = self.shared.mutate_fn.clone();
        let request = self.shared.ctx.executor.execute_mutation(
            variables,
            move |v| mutate_fn(v),
            &self.shared.options,
        );
        let shared = self.shared.clone();

        async move {
            let result = request.await;
            {
                let mut state = shared.state.borrow_mut();
                state.pending = state.pending.saturating_sub(1);
                match &result {
                    Ok(data) => {
                        state.data = Some(data.clone());
                        state.error = None;
                    }
                    Err(err) => state.error = Some(err.clone()),
                }
            }
            shared.subscribers.notify();
            result
        }
    }

    /// Run the mutation in the background. The outcome lands in
    /// [`data`](Self::data) / [`error`](Self::error).
    pub fn mutate(&self, variables: V) -> Result<()> {
        let request = self.mutate_async(variables);
        self.shared
            .ctx
            .spawner
            .spawn_local(async move {
                let _ = request.await;
            })
            .map_err(QueryError::from)
    }

    /// Whether a mutation is outstanding.
    pub fn is_pending(&self) -> bool {
        self.shared.state.borrow().pending > 0
    }

    /// Result of the last successful mutation.
    pub fn data(&self) -> Option<T> {
        self.shared.state.borrow().data.clone()
    }

    /// Error of the last failed mutation.
    pub fn error(&self) -> Option<QueryError> {
        self.shared.state.borrow().error.clone()
    }

    /// Whether the last mutation failed.
    pub fn is_error(&self) -> bool {
        self.shared.state.borrow().error.is_some()
    }

    /// Forget the last result and error.
    pub fn reset(&self) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.data = None;
            state.error = None;
        }
        self.shared.subscribers.notify();
    }

    /// Run `callback` after every state change.
    pub fn on_change(&self, callback: impl Fn() + 'static) {
        self.shared.subscribers.push(Rc::new(callback));
    }
}

impl<V, T> std::fmt::Debug for MutationHook<V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("MutationHook")
            .field("pending", &state.pending)
            .field("has_data", &state.data.is_some())
            .field("error", &state.error)
            .finish_non_exhaustive()
    }
}

// === Infinite query ===

struct InfiniteState<T> {
    data: Option<InfiniteData<T>>,
    status: QueryStatus,
    error: Option<QueryError>,
    fetching: bool,
    fetching_next: bool,
    fetching_previous: bool,
    listeners: Option<ListenerGuard>,
}

struct InfiniteShared<T> {
    ctx: HookContext,
    key: String,
    initial_param: Value,
    options: QueryOptions,
    fetcher: PageFetcher<T>,
    state: RefCell<InfiniteState<T>>,
    subscribers: Subscribers,
    mounted: Cell<bool>,
}

/// `{ data: { pages }, fetchNextPage, hasNextPage, isFetchingNextPage }`.
pub struct InfiniteQueryHook<T: Serialize + DeserializeOwned + Clone + 'static> {
    shared: Rc<InfiniteShared<T>>,
    cache_listener: ListenerId,
    poll: Option<TimerHandle>,
}

impl<T> InfiniteShared<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    fn start(self: &Rc<Self>, force: bool) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.fetching {
                return Ok(());
            }
            state.fetching = true;
            if state.data.is_none() {
                state.status = QueryStatus::Loading;
            }
        }
        self.subscribers.notify();

        let this = self.clone();
        let spawned = self.ctx.spawner.spawn_local(async move {
            let fetcher = this.fetcher.clone();
            let executor = &this.ctx.executor;
            let initial = this.initial_param.clone();
            let result = if force {
                executor
                    .refetch_infinite_query(&this.key, initial, move |p| fetcher(p), &this.options)
                    .await
            } else {
                executor
                    .execute_infinite_query(&this.key, initial, move |p| fetcher(p), &this.options)
                    .await
            };
            this.finish(result);
        });
        spawned.map_err(|err| {
            let err = QueryError::from(err);
            self.finish(Err(err.clone()));
            err
        })
    }

    fn finish(&self, result: Result<QueryOutcome<InfiniteData<T>>>) {
        let released = {
            let mut state = self.state.borrow_mut();
            state.fetching = false;
            match result {
                Ok(outcome) => {
                    state.data = Some(outcome.data);
                    state.status = QueryStatus::Success;
                    state.error = None;
                    if self.mounted.get() {
                        std::mem::replace(&mut state.listeners, outcome.listeners)
                    } else {
                        outcome.listeners
                    }
                }
                Err(err) => {
                    tracing::debug!(key = %self.key, error = %err, "infinite query failed");
                    state.status = QueryStatus::Error;
                    state.error = Some(err);
                    None
                }
            }
        };
        drop(released);
        self.subscribers.notify();
    }

    fn fetch_page(self: &Rc<Self>, direction: PageDirection) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let available = state.data.as_ref().is_some_and(|d| match direction {
                PageDirection::Next => d.has_next_page,
                PageDirection::Previous => d.has_previous_page,
            });
            let flag = match direction {
                PageDirection::Next => &mut state.fetching_next,
                PageDirection::Previous => &mut state.fetching_previous,
            };
            if *flag || !available {
                return Ok(());
            }
            *flag = true;
        }
        self.subscribers.notify();

        let this = self.clone();
        let spawned = self.ctx.spawner.spawn_local(async move {
            let fetcher = this.fetcher.clone();
            let executor = &this.ctx.executor;
            let result = match direction {
                PageDirection::Next => {
                    executor
                        .fetch_next_page(&this.key, move |p| fetcher(p), &this.options)
                        .await
                }
                PageDirection::Previous => {
                    executor
                        .fetch_previous_page(&this.key, move |p| fetcher(p), &this.options)
                        .await
                }
            };
            this.finish_page(direction, result);
        });
        spawned.map_err(|err| {
            let err = QueryError::from(err);
            self.finish_page(direction, Err(err.clone()));
            err
        })
    }

    fn finish_page(&self, direction: PageDirection, result: Result<InfiniteData<T>>) {
        {
            let mut state = self.state.borrow_mut();
            match direction {
                PageDirection::Next => state.fetching_next = false,
                PageDirection::Previous => state.fetching_previous = false,
            }
            match result {
                Ok(data) => {
                    state.data = Some(data);
                    state.status = QueryStatus::Success;
                    state.error = None;
                }
                Err(err) => {
                    tracing::debug!(key = %self.key, error = %err, "page fetch failed");
                    state.status = QueryStatus::Error;
                    state.error = Some(err);
                }
            }
        }
        self.subscribers.notify();
    }

    fn sync_from_cache(self: &Rc<Self>) {
        let Some(entry) = self.ctx.executor.cache().get_entry(&self.key) else {
            return;
        };
        match serde_json::from_value::<InfiniteData<T>>(entry.data) {
            Ok(data) => {
                {
                    let mut state = self.state.borrow_mut();
                    state.data = Some(data);
                    state.status = QueryStatus::Success;
                    state.error = None;
                }
                self.subscribers.notify();
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "cached pages have unexpected shape");
            }
        }
    }

    fn refetch_after_removal(self: &Rc<Self>) {
        if !self.mounted.get() || !self.options.enabled {
            return;
        }
        if let Err(err) = self.start(true) {
            tracing::warn!(key = %self.key, error = %err, "refetch after invalidation failed");
        }
    }
}

impl<T> InfiniteQueryHook<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    /// Mount an infinite query hook starting at `initial_param`.
    ///
    /// Polling, when the profile has a refetch interval, starts over from
    /// the initial page like [`refetch`](Self::refetch).
    pub fn mount(
        ctx: HookContext,
        key: impl Into<String>,
        initial_param: Value,
        fetcher: PageFetcher<T>,
        options: QueryOptions,
    ) -> Self {
        let key = key.into();
        let profile = options.resolve(ctx.executor.profiles());
        let shared = Rc::new(InfiniteShared {
            ctx: ctx.clone(),
            key: key.clone(),
            initial_param,
            options,
            fetcher,
            state: RefCell::new(InfiniteState {
                data: None,
                status: QueryStatus::Idle,
                error: None,
                fetching: false,
                fetching_next: false,
                fetching_previous: false,
                listeners: None,
            }),
            subscribers: Subscribers::default(),
            mounted: Cell::new(true),
        });

        let cache_listener = ctx.executor.cache().subscribe(watch_key(
            &shared,
            key,
            InfiniteShared::sync_from_cache,
            InfiniteShared::refetch_after_removal,
        ));

        let poll = profile
            .refetch_interval_ms
            .filter(|ms| *ms > 0 && shared.options.enabled)
            .map(|ms| {
                let weak = Rc::downgrade(&shared);
                ctx.timer.set_interval(
                    ms,
                    Box::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            if let Err(err) = shared.start(true) {
                                tracing::warn!(key = %shared.key, error = %err, "polling page refetch failed");
                            }
                        }
                    }),
                )
            });

        if shared.options.enabled {
            if let Err(err) = shared.start(false) {
                tracing::warn!(key = %shared.key, error = %err, "initial page fetch could not start");
            }
        }

        Self {
            shared,
            cache_listener,
            poll,
        }
    }

    /// Accumulated pages.
    pub fn data(&self) -> Option<InfiniteData<T>> {
        self.shared.state.borrow().data.clone()
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.shared.state.borrow().status
    }

    /// Fetch the page after the last one, if there is one.
    pub fn fetch_next_page(&self) -> Result<()> {
        self.shared.fetch_page(PageDirection::Next)
    }

    /// Fetch the page before the first one, if there is one.
    pub fn fetch_previous_page(&self) -> Result<()> {
        self.shared.fetch_page(PageDirection::Previous)
    }

    /// Whether a later page exists.
    pub fn has_next_page(&self) -> bool {
        self.shared
            .state
            .borrow()
            .data
            .as_ref()
            .is_some_and(|d| d.has_next_page)
    }

    /// Whether an earlier page exists.
    pub fn has_previous_page(&self) -> bool {
        self.shared
            .state
            .borrow()
            .data
            .as_ref()
            .is_some_and(|d| d.has_previous_page)
    }

    /// Next page outstanding.
    pub fn is_fetching_next_page(&self) -> bool {
        self.shared.state.borrow().fetching_next
    }

    /// Previous page outstanding.
    pub fn is_fetching_previous_page(&self) -> bool {
        self.shared.state.borrow().fetching_previous
    }

    /// First page outstanding, no data yet.
    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Loading
    }

    /// Last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    /// Error of the last fetch.
    pub fn error(&self) -> Option<QueryError> {
        self.shared.state.borrow().error.clone()
    }

    /// Start over from the initial page.
    pub fn refetch(&self) -> Result<()> {
        self.shared.start(true)
    }

    /// Run `callback` after every state change.
    pub fn on_change(&self, callback: impl Fn() + 'static) {
        self.shared.subscribers.push(Rc::new(callback));
    }
}

impl<T> Drop for InfiniteQueryHook<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.mounted.set(false);
        shared.ctx.executor.cache().unsubscribe(self.cache_listener);
        if let Some(handle) = self.poll.take() {
            shared.ctx.timer.clear_interval(handle);
        }
        let listeners = shared.state.borrow_mut().listeners.take();
        drop(listeners);
    }
}

impl<T> std::fmt::Debug for InfiniteQueryHook<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteQueryHook")
            .field("key", &self.shared.key)
            .field("status", &self.status())
            .field("has_next_page", &self.has_next_page())
            .finish_non_exhaustive()
    }
}
