//! Composition root.
//!
//! One [`QueryClient`] per session owns the shared cache and wires the
//! realtime manager, executor and hooks to it.

use crate::error::Result;
use crate::executor::{MutationOptions, PageResponse, QueryExecutor, QueryOptions};
use crate::hooks::{
    Fetcher, HookContext, InfiniteQueryHook, MutateFn, MutationHook, PageFetcher, QueryHook,
};
use crate::realtime::RealtimeManager;
use crate::transport::{LocalTransport, RealtimeTransport};
use futures::task::LocalSpawn;
use futures::FutureExt;
use querycast_core::{CacheManager, CacheProfile, Clock, QueryConfig, StrategyName, Timer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::rc::Rc;

#[cfg(not(target_arch = "wasm32"))]
use futures::executor::LocalPool;
#[cfg(not(target_arch = "wasm32"))]
use std::cell::RefCell;

/// Builder for [`QueryClient`].
///
/// Unset pieces take host defaults. In the browser these are `Date.now()`,
/// `setInterval` and `spawn_local`. Natively the clock is the system clock,
/// the timer is a [`ManualTimer`](querycast_core::ManualTimer) the host
/// advances, and background work runs on a client-owned pool driven by
/// [`QueryClient::run_until_stalled`]. The transport defaults to an
/// in-process [`LocalTransport`].
#[derive(Default)]
pub struct QueryClientBuilder {
    config: QueryConfig,
    clock: Option<Rc<dyn Clock>>,
    timer: Option<Rc<dyn Timer>>,
    transport: Option<Rc<dyn RealtimeTransport>>,
    spawner: Option<Rc<dyn LocalSpawn>>,
}

impl QueryClientBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config`.
    #[must_use]
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` for staleness and eviction.
    #[must_use]
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `timer` for the cleanup sweep and polling.
    #[must_use]
    pub fn timer(mut self, timer: Rc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Use `transport` for realtime topics.
    #[must_use]
    pub fn transport(mut self, transport: Rc<dyn RealtimeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run background fetches on `spawner`.
    #[must_use]
    pub fn spawner(mut self, spawner: Rc<dyn LocalSpawn>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Assemble the client and start the cleanup sweep.
    pub fn build(self) -> QueryClient {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(default_clock);
        let timer = self.timer.unwrap_or_else(default_timer);
        let transport = self
            .transport
            .unwrap_or_else(|| Rc::new(LocalTransport::new()));

        #[cfg(not(target_arch = "wasm32"))]
        let (spawner, pool) = match self.spawner {
            Some(spawner) => (spawner, None),
            None => {
                let pool = LocalPool::new();
                let spawner: Rc<dyn LocalSpawn> = Rc::new(pool.spawner());
                (spawner, Some(RefCell::new(pool)))
            }
        };
        #[cfg(target_arch = "wasm32")]
        let spawner = self
            .spawner
            .unwrap_or_else(|| Rc::new(crate::browser::BrowserSpawner));

        let cache = Rc::new(
            CacheManager::new(clock, timer.clone())
                .with_default_cache_time(config.default_cache_time_ms),
        );
        // An interval of zero installs the sweep without arming a timer.
        cache.start_cleanup(config.cleanup_interval_ms);

        let realtime = RealtimeManager::new(cache.clone(), transport, &config.identity_field);
        let executor = QueryExecutor::new(cache.clone(), realtime.clone(), config.profile_table());

        tracing::debug!(
            environment = %config.environment,
            cleanup_interval_ms = config.cleanup_interval_ms,
            "query client ready"
        );

        QueryClient {
            ctx: HookContext {
                executor,
                spawner,
                timer,
            },
            cache,
            realtime,
            config,
            #[cfg(not(target_arch = "wasm32"))]
            pool,
        }
    }
}

impl std::fmt::Debug for QueryClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClientBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn default_clock() -> Rc<dyn Clock> {
    Rc::new(querycast_core::SystemClock)
}

#[cfg(target_arch = "wasm32")]
fn default_clock() -> Rc<dyn Clock> {
    Rc::new(crate::browser::DateClock)
}

#[cfg(not(target_arch = "wasm32"))]
fn default_timer() -> Rc<dyn Timer> {
    Rc::new(querycast_core::ManualTimer::new())
}

#[cfg(target_arch = "wasm32")]
fn default_timer() -> Rc<dyn Timer> {
    Rc::new(crate::browser::IntervalTimer::new())
}

/// Session-wide query client.
pub struct QueryClient {
    ctx: HookContext,
    cache: Rc<CacheManager>,
    realtime: RealtimeManager,
    config: QueryConfig,
    #[cfg(not(target_arch = "wasm32"))]
    pool: Option<RefCell<LocalPool>>,
}

impl QueryClient {
    /// Start building a client.
    #[must_use]
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    /// Shared cache.
    pub fn cache(&self) -> &Rc<CacheManager> {
        &self.cache
    }

    /// Query executor.
    pub fn executor(&self) -> &QueryExecutor {
        &self.ctx.executor
    }

    /// Realtime manager.
    pub fn realtime(&self) -> &RealtimeManager {
        &self.realtime
    }

    /// Active configuration.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Resolved profile for the active environment.
    pub fn profile(&self, name: StrategyName) -> CacheProfile {
        self.ctx.executor.profiles().resolve(name)
    }

    /// Mount a query hook.
    pub fn use_query<T, F, Fut>(
        &self,
        key: impl Into<String>,
        fetcher: F,
        options: QueryOptions,
    ) -> QueryHook<T>
    where
        T: Serialize + DeserializeOwned + Clone + 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let fetcher: Fetcher<T> = Rc::new(move || fetcher().boxed_local());
        QueryHook::mount(self.ctx.clone(), key, fetcher, options)
    }

    /// Create a mutation hook.
    pub fn use_mutation<V, T, F, Fut>(
        &self,
        mutate_fn: F,
        options: MutationOptions<V>,
    ) -> MutationHook<V, T>
    where
        V: 'static,
        T: Serialize + Clone + 'static,
        F: Fn(V) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let mutate_fn: MutateFn<V, T> = Rc::new(move |v| mutate_fn(v).boxed_local());
        MutationHook::new(self.ctx.clone(), mutate_fn, options)
    }

    /// Mount an infinite query hook.
    pub fn use_infinite_query<T, F, Fut>(
        &self,
        key: impl Into<String>,
        initial_param: Value,
        fetcher: F,
        options: QueryOptions,
    ) -> InfiniteQueryHook<T>
    where
        T: Serialize + DeserializeOwned + Clone + 'static,
        F: Fn(Value) -> Fut + 'static,
        Fut: Future<Output = Result<PageResponse<T>>> + 'static,
    {
        let fetcher: PageFetcher<T> = Rc::new(move |param| fetcher(param).boxed_local());
        InfiniteQueryHook::mount(self.ctx.clone(), key, initial_param, fetcher, options)
    }

    /// Run background work on the client-owned pool until nothing can
    /// progress. A no-op when a spawner was supplied.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn run_until_stalled(&self) {
        if let Some(pool) = &self.pool {
            pool.borrow_mut().run_until_stalled();
        }
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        self.cache.stop_cleanup();
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
