//! Query executor: queries, mutations and infinite queries.
//!
//! # Single-flight
//!
//! Each outstanding fetch is a [`Shared`] future registered under a flight
//! key (`query:<key>` or `page:<key>#<param>`). Later callers for the same
//! flight key await the same future instead of calling their fetcher. The
//! shared future itself writes the result into the cache, so N waiters
//! produce one fetch and one write. A failed fetch writes nothing. While a
//! flight is outstanding its cache key is pinned against eviction.
//!
//! # Write ordering
//!
//! Writes to one key land in the order their fetches resolve. A slow
//! refetch that resolves after a faster one overwrites it: last resolved
//! wins. There is no resolution-order fencing.

use crate::error::{QueryError, Result};
use crate::realtime::{ListenerGuard, RealtimeManager};
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use querycast_core::{
    canonical_json, CacheEntry, CacheManager, CacheProfile, PinGuard, ProfileTable, StrategyName,
    UpdateStrategy,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

type SharedFetch = Shared<LocalBoxFuture<'static, Result<Value>>>;

/// Options for queries and infinite queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Cache profile to resolve timings from
    pub strategy: StrategyName,
    /// Overrides the profile's stale time
    pub stale_time_ms: Option<u64>,
    /// Overrides the profile's cache time
    pub cache_time_ms: Option<u64>,
    /// Realtime topics keeping the entry live
    pub websocket_topics: Vec<String>,
    /// Merge policy for realtime messages
    pub update_strategy: UpdateStrategy,
    /// Whether hooks fetch on mount
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyName::UserContent,
            stale_time_ms: None,
            cache_time_ms: None,
            websocket_topics: Vec::new(),
            update_strategy: UpdateStrategy::default(),
            enabled: true,
        }
    }
}

impl QueryOptions {
    /// Options using the given profile.
    pub fn new(strategy: StrategyName) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Override the stale time.
    pub fn with_stale_time(mut self, ms: u64) -> Self {
        self.stale_time_ms = Some(ms);
        self
    }

    /// Override the cache time.
    pub fn with_cache_time(mut self, ms: u64) -> Self {
        self.cache_time_ms = Some(ms);
        self
    }

    /// Add a realtime topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.websocket_topics.push(topic.into());
        self
    }

    /// Set the realtime merge policy.
    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    /// Enable or disable fetching on mount.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Profile timings with per-query overrides applied.
    pub fn resolve(&self, profiles: &ProfileTable) -> CacheProfile {
        let base = profiles.resolve(self.strategy);
        CacheProfile {
            stale_time_ms: self.stale_time_ms.unwrap_or(base.stale_time_ms),
            cache_time_ms: self.cache_time_ms.unwrap_or(base.cache_time_ms),
            refetch_interval_ms: base.refetch_interval_ms,
        }
    }
}

/// Where query data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Fresh cache entry, fetcher not called
    Cache,
    /// Fetched (or joined an in-flight fetch)
    Network,
}

/// Result of a query.
#[derive(Debug)]
pub struct QueryOutcome<T> {
    /// Query data
    pub data: T,
    /// Where the data came from
    pub source: DataSource,
    /// Realtime registration, present when topics were requested
    pub listeners: Option<ListenerGuard>,
}

/// Speculative cache write applied before a mutation resolves.
pub struct OptimisticUpdate<V> {
    /// Key to update
    pub key: String,
    /// TTL for the speculative entry
    pub ttl_ms: Option<u64>,
    updater: Rc<dyn Fn(Option<Value>, &V) -> Value>,
}

impl<V> OptimisticUpdate<V> {
    /// `updater` maps the current cached value and the variables to the
    /// speculative value.
    pub fn new(
        key: impl Into<String>,
        updater: impl Fn(Option<Value>, &V) -> Value + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            ttl_ms: None,
            updater: Rc::new(updater),
        }
    }

    /// TTL for the speculative entry.
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

impl<V> Clone for OptimisticUpdate<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            ttl_ms: self.ttl_ms,
            updater: self.updater.clone(),
        }
    }
}

impl<V> std::fmt::Debug for OptimisticUpdate<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("key", &self.key)
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

/// Write of a mutation result into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    /// Target key
    pub key: String,
    /// TTL for the written entry
    pub cache_time_ms: Option<u64>,
}

/// Options for mutations.
pub struct MutationOptions<V> {
    /// Speculative update, rolled back on failure
    pub optimistic_update: Option<OptimisticUpdate<V>>,
    /// Keys invalidated on success
    pub invalidate_queries: Vec<String>,
    /// Topics notified on success
    pub websocket_events: Vec<String>,
    /// Where to store the mutation result on success
    pub update_cache: Option<CacheWrite>,
}

impl<V> Default for MutationOptions<V> {
    fn default() -> Self {
        Self {
            optimistic_update: None,
            invalidate_queries: Vec::new(),
            websocket_events: Vec::new(),
            update_cache: None,
        }
    }
}

impl<V> Clone for MutationOptions<V> {
    fn clone(&self) -> Self {
        Self {
            optimistic_update: self.optimistic_update.clone(),
            invalidate_queries: self.invalidate_queries.clone(),
            websocket_events: self.websocket_events.clone(),
            update_cache: self.update_cache.clone(),
        }
    }
}

impl<V> std::fmt::Debug for MutationOptions<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOptions")
            .field("optimistic_update", &self.optimistic_update)
            .field("invalidate_queries", &self.invalidate_queries)
            .field("websocket_events", &self.websocket_events)
            .field("update_cache", &self.update_cache)
            .finish()
    }
}

impl<V> MutationOptions<V> {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a speculative update before the mutation resolves.
    pub fn with_optimistic_update(mut self, update: OptimisticUpdate<V>) -> Self {
        self.optimistic_update = Some(update);
        self
    }

    /// Invalidate `key` on success.
    pub fn invalidates(mut self, key: impl Into<String>) -> Self {
        self.invalidate_queries.push(key.into());
        self
    }

    /// Publish a mutation event on `topic` on success.
    pub fn emits(mut self, topic: impl Into<String>) -> Self {
        self.websocket_events.push(topic.into());
        self
    }

    /// Store the mutation result under `key` on success.
    pub fn writes_to(mut self, key: impl Into<String>, cache_time_ms: Option<u64>) -> Self {
        self.update_cache = Some(CacheWrite {
            key: key.into(),
            cache_time_ms,
        });
        self
    }
}

/// One page returned by an infinite-query fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    /// Page items
    pub data: Vec<T>,
    /// Whether a later page exists
    pub has_next_page: bool,
    /// Whether an earlier page exists
    #[serde(default)]
    pub has_previous_page: bool,
    /// Param for the next page, if not `param + 1`
    #[serde(default)]
    pub next_cursor: Option<Value>,
    /// Param for the previous page, if not `param - 1`
    #[serde(default)]
    pub previous_cursor: Option<Value>,
}

impl<T> PageResponse<T> {
    /// Page with a next-page flag and no cursors.
    pub fn new(data: Vec<T>, has_next_page: bool) -> Self {
        Self {
            data,
            has_next_page,
            has_previous_page: false,
            next_cursor: None,
            previous_cursor: None,
        }
    }

    /// Set the previous-page flag.
    pub fn with_previous(mut self, has_previous_page: bool) -> Self {
        self.has_previous_page = has_previous_page;
        self
    }

    /// Set the next-page cursor.
    pub fn with_next_cursor(mut self, cursor: impl Into<Value>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    /// Set the previous-page cursor.
    pub fn with_previous_cursor(mut self, cursor: impl Into<Value>) -> Self {
        self.previous_cursor = Some(cursor.into());
        self
    }
}

/// Accumulated pages of an infinite query, stored as one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteData<T> {
    /// Pages in display order
    pub pages: Vec<Vec<T>>,
    /// Param each page was fetched with
    pub page_params: Vec<Value>,
    /// Whether a later page exists
    pub has_next_page: bool,
    /// Whether an earlier page exists
    pub has_previous_page: bool,
    /// Cursor reported by the last page
    #[serde(default)]
    pub next_cursor: Option<Value>,
    /// Cursor reported by the first page
    #[serde(default)]
    pub previous_cursor: Option<Value>,
}

/// Which end of an infinite query to extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    /// After the last page
    Next,
    /// Before the first page
    Previous,
}

impl<T> InfiniteData<T> {
    /// Data holding only the first fetched page.
    pub fn first(param: Value, page: PageResponse<T>) -> Self {
        Self {
            pages: vec![page.data],
            page_params: vec![param],
            has_next_page: page.has_next_page,
            has_previous_page: page.has_previous_page,
            next_cursor: page.next_cursor,
            previous_cursor: page.previous_cursor,
        }
    }

    /// Param of the page after the last one.
    pub fn next_page_param(&self) -> Option<Value> {
        self.next_cursor
            .clone()
            .or_else(|| self.page_params.last().and_then(|p| step(p, 1)))
    }

    /// Param of the page before the first one.
    pub fn previous_page_param(&self) -> Option<Value> {
        self.previous_cursor
            .clone()
            .or_else(|| self.page_params.first().and_then(|p| step(p, -1)))
    }

    /// Add a page at one end.
    ///
    /// Returns `false` without changing anything when a page with `param`
    /// is already present.
    pub fn insert_page(&mut self, param: Value, page: PageResponse<T>, direction: PageDirection) -> bool {
        if self.page_params.contains(&param) {
            return false;
        }
        match direction {
            PageDirection::Next => {
                self.pages.push(page.data);
                self.page_params.push(param);
                self.has_next_page = page.has_next_page;
                self.next_cursor = page.next_cursor;
            }
            PageDirection::Previous => {
                self.pages.insert(0, page.data);
                self.page_params.insert(0, param);
                self.has_previous_page = page.has_previous_page;
                self.previous_cursor = page.previous_cursor;
            }
        }
        true
    }

    /// Items of every page, in order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flatten()
    }
}

fn step(param: &Value, delta: i64) -> Option<Value> {
    param.as_i64().map(|n| Value::from(n.saturating_add(delta)))
}

fn page_flight_key(key: &str, param: &Value) -> String {
    format!("page:{key}#{}", canonical_json(param))
}

struct ExecutorInner {
    cache: Rc<CacheManager>,
    realtime: RealtimeManager,
    profiles: ProfileTable,
    in_flight: RefCell<HashMap<String, SharedFetch>>,
}

/// Orchestrates fetches against the shared cache.
#[derive(Clone)]
pub struct QueryExecutor {
    inner: Rc<ExecutorInner>,
}

/// Restores the pre-mutation entry on drop unless committed.
struct Rollback {
    cache: Rc<CacheManager>,
    key: String,
    snapshot: Option<CacheEntry>,
    committed: bool,
    _pin: PinGuard,
}

impl Rollback {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        tracing::debug!(key = %self.key, "optimistic update rolled back");
        self.cache.restore(&self.key, self.snapshot.take());
    }
}

struct Reconcile {
    invalidate_queries: Vec<String>,
    websocket_events: Vec<String>,
    update_cache: Option<CacheWrite>,
}

impl QueryExecutor {
    /// Create an executor over `cache`.
    pub fn new(cache: Rc<CacheManager>, realtime: RealtimeManager, profiles: ProfileTable) -> Self {
        Self {
            inner: Rc::new(ExecutorInner {
                cache,
                realtime,
                profiles,
                in_flight: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Shared cache.
    pub fn cache(&self) -> &Rc<CacheManager> {
        &self.inner.cache
    }

    /// Realtime manager.
    pub fn realtime(&self) -> &RealtimeManager {
        &self.inner.realtime
    }

    /// Profiles used to resolve query timings.
    pub fn profiles(&self) -> &ProfileTable {
        &self.inner.profiles
    }

    /// Number of outstanding fetches.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.borrow().len()
    }

    /// Whether a query or page fetch for `key` is outstanding.
    pub fn is_fetching(&self, key: &str) -> bool {
        let query = format!("query:{key}");
        let page = format!("page:{key}#");
        self.inner
            .in_flight
            .borrow()
            .keys()
            .any(|k| *k == query || k.starts_with(&page))
    }

    /// Return fresh cached data, or fetch it.
    ///
    /// A present entry counts as a cache hit even when it is stale and gets
    /// refetched. Realtime listeners are attached on both paths.
    pub async fn execute_query<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: &QueryOptions,
    ) -> Result<QueryOutcome<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let profile = options.resolve(&self.inner.profiles);
        if let Some(data) = self.inner.cache.get::<T>(key) {
            if !self.inner.cache.is_stale(key, profile.stale_time_ms) {
                tracing::trace!(key, "query served from cache");
                return Ok(QueryOutcome {
                    data,
                    source: DataSource::Cache,
                    listeners: self.attach(key, options, &profile),
                });
            }
        }
        self.fetch_query(key, fetcher, options, profile).await
    }

    /// Fetch regardless of freshness. Joins an in-flight fetch if any.
    pub async fn refetch_query<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: &QueryOptions,
    ) -> Result<QueryOutcome<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let profile = options.resolve(&self.inner.profiles);
        self.fetch_query(key, fetcher, options, profile).await
    }

    async fn fetch_query<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: &QueryOptions,
        profile: CacheProfile,
    ) -> Result<QueryOutcome<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let cache = self.inner.cache.clone();
        let entry_key = key.to_string();
        let shared = self.single_flight(format!("query:{key}"), key, move || {
            let request = fetcher();
            async move {
                let data = request.await?;
                let value = serde_json::to_value(&data)?;
                cache.set_value(entry_key, value.clone(), Some(profile.cache_time_ms));
                Ok(value)
            }
            .boxed_local()
        });

        let data = serde_json::from_value(shared.await?)?;
        Ok(QueryOutcome {
            data,
            source: DataSource::Network,
            listeners: self.attach(key, options, &profile),
        })
    }

    /// Run a mutation.
    ///
    /// The optimistic update, if any, is written when this is called, before
    /// the returned future is polled. On failure the cache is restored to the
    /// exact pre-mutation entry and the error is returned. Dropping the
    /// future before it resolves restores the entry as well. On success the
    /// result is optionally written, `invalidate_queries` are invalidated and
    /// `{"type": "mutation", "data": result}` is published to every
    /// `websocket_events` topic.
    pub fn execute_mutation<V, T, F, Fut>(
        &self,
        variables: V,
        mutate_fn: F,
        options: &MutationOptions<V>,
    ) -> impl Future<Output = Result<T>> + 'static
    where
        V: 'static,
        T: Serialize + 'static,
        F: FnOnce(V) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let rollback = options
            .optimistic_update
            .as_ref()
            .map(|update| self.apply_optimistic(update, &variables));
        let request = mutate_fn(variables);
        let executor = self.clone();
        let reconcile = Reconcile {
            invalidate_queries: options.invalidate_queries.clone(),
            websocket_events: options.websocket_events.clone(),
            update_cache: options.update_cache.clone(),
        };

        async move {
            match request.await {
                Ok(result) => {
                    if let Some(rollback) = rollback {
                        rollback.commit();
                    }
                    executor.reconcile(&result, &reconcile)?;
                    Ok(result)
                }
                Err(err) => {
                    if let Some(rollback) = &rollback {
                        tracing::warn!(key = %rollback.key, error = %err, "mutation failed, rolling back");
                    }
                    drop(rollback);
                    Err(err)
                }
            }
        }
    }

    fn apply_optimistic<V>(&self, update: &OptimisticUpdate<V>, variables: &V) -> Rollback {
        let cache = &self.inner.cache;
        let pin = cache.pin(&update.key);
        let snapshot = cache.snapshot(&update.key);
        let next = (update.updater)(snapshot.as_ref().map(|e| e.data.clone()), variables);
        cache.set_value(update.key.clone(), next, update.ttl_ms);
        tracing::debug!(key = %update.key, "optimistic update applied");
        Rollback {
            cache: cache.clone(),
            key: update.key.clone(),
            snapshot,
            committed: false,
            _pin: pin,
        }
    }

    fn reconcile<T: Serialize>(&self, result: &T, options: &Reconcile) -> Result<()> {
        let cache = &self.inner.cache;
        if let Some(write) = &options.update_cache {
            cache.set(write.key.clone(), result, write.cache_time_ms)?;
        }
        for key in &options.invalidate_queries {
            cache.invalidate(key);
        }
        if !options.websocket_events.is_empty() {
            let frame = json!({ "type": "mutation", "data": serde_json::to_value(result)? });
            for topic in &options.websocket_events {
                self.inner.realtime.emit(topic, &frame);
            }
        }
        Ok(())
    }

    /// Return fresh cached pages, or fetch the first page.
    ///
    /// A refetch starts over from `initial_param` and replaces the stored
    /// pages.
    pub async fn execute_infinite_query<T, F, Fut>(
        &self,
        key: &str,
        initial_param: Value,
        fetcher: F,
        options: &QueryOptions,
    ) -> Result<QueryOutcome<InfiniteData<T>>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<PageResponse<T>>> + 'static,
    {
        let profile = options.resolve(&self.inner.profiles);
        if let Some(data) = self.inner.cache.get::<InfiniteData<T>>(key) {
            if !self.inner.cache.is_stale(key, profile.stale_time_ms) {
                return Ok(QueryOutcome {
                    data,
                    source: DataSource::Cache,
                    listeners: self.attach(key, options, &profile),
                });
            }
        }

        self.fetch_first_page(key, initial_param, fetcher, options, profile)
            .await
    }

    /// Refetch from `initial_param` regardless of freshness, replacing the
    /// stored pages.
    pub async fn refetch_infinite_query<T, F, Fut>(
        &self,
        key: &str,
        initial_param: Value,
        fetcher: F,
        options: &QueryOptions,
    ) -> Result<QueryOutcome<InfiniteData<T>>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<PageResponse<T>>> + 'static,
    {
        let profile = options.resolve(&self.inner.profiles);
        self.fetch_first_page(key, initial_param, fetcher, options, profile)
            .await
    }

    async fn fetch_first_page<T, F, Fut>(
        &self,
        key: &str,
        initial_param: Value,
        fetcher: F,
        options: &QueryOptions,
        profile: CacheProfile,
    ) -> Result<QueryOutcome<InfiniteData<T>>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<PageResponse<T>>> + 'static,
    {
        let cache = self.inner.cache.clone();
        let entry_key = key.to_string();
        let flight = page_flight_key(key, &initial_param);
        let shared = self.single_flight(flight, key, move || {
            let request = fetcher(initial_param.clone());
            async move {
                let page = request.await?;
                let data = InfiniteData::first(initial_param, page);
                let value = serde_json::to_value(&data)?;
                cache.set_value(entry_key, value.clone(), Some(profile.cache_time_ms));
                Ok(value)
            }
            .boxed_local()
        });

        let data = serde_json::from_value(shared.await?)?;
        Ok(QueryOutcome {
            data,
            source: DataSource::Network,
            listeners: self.attach(key, options, &profile),
        })
    }

    /// Fetch and append the page after the last one.
    ///
    /// Returns the current data without fetching when `has_next_page` is
    /// false.
    pub async fn fetch_next_page<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: &QueryOptions,
    ) -> Result<InfiniteData<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<PageResponse<T>>> + 'static,
    {
        self.fetch_adjacent_page(key, fetcher, options, PageDirection::Next)
            .await
    }

    /// Fetch and prepend the page before the first one.
    ///
    /// Returns the current data without fetching when `has_previous_page` is
    /// false.
    pub async fn fetch_previous_page<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: &QueryOptions,
    ) -> Result<InfiniteData<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<PageResponse<T>>> + 'static,
    {
        self.fetch_adjacent_page(key, fetcher, options, PageDirection::Previous)
            .await
    }

    async fn fetch_adjacent_page<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: &QueryOptions,
        direction: PageDirection,
    ) -> Result<InfiniteData<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<PageResponse<T>>> + 'static,
    {
        let Some(current) = self.inner.cache.get::<InfiniteData<T>>(key) else {
            return Err(QueryError::Invalidated(key.to_string()));
        };
        let param = match direction {
            PageDirection::Next if current.has_next_page => current.next_page_param(),
            PageDirection::Previous if current.has_previous_page => current.previous_page_param(),
            _ => None,
        };
        let Some(param) = param else {
            return Ok(current);
        };

        let profile = options.resolve(&self.inner.profiles);
        let cache = self.inner.cache.clone();
        let entry_key = key.to_string();
        let flight = page_flight_key(key, &param);
        let shared = self.single_flight(flight, key, move || {
            let request = fetcher(param.clone());
            async move {
                let page = request.await?;
                let latest = cache
                    .get_entry(&entry_key)
                    .and_then(|e| serde_json::from_value::<InfiniteData<T>>(e.data).ok());
                let Some(mut data) = latest else {
                    tracing::debug!(key = %entry_key, "infinite query removed while loading page");
                    return Err(QueryError::Invalidated(entry_key));
                };
                if data.insert_page(param, page, direction) {
                    cache.set(entry_key, &data, Some(profile.cache_time_ms))?;
                }
                Ok(serde_json::to_value(&data)?)
            }
            .boxed_local()
        });

        Ok(serde_json::from_value(shared.await?)?)
    }

    fn single_flight<M>(&self, flight_key: String, pin_key: &str, make: M) -> SharedFetch
    where
        M: FnOnce() -> LocalBoxFuture<'static, Result<Value>>,
    {
        if let Some(existing) = self.inner.in_flight.borrow().get(&flight_key) {
            tracing::trace!(flight = %flight_key, "joining in-flight request");
            return existing.clone();
        }

        let request = make();
        let pin = self.inner.cache.pin(pin_key);
        let executor = Rc::downgrade(&self.inner);
        let done_key = flight_key.clone();
        let shared = async move {
            let result = request.await;
            drop(pin);
            if let Some(inner) = executor.upgrade() {
                inner.in_flight.borrow_mut().remove(&done_key);
            }
            result
        }
        .boxed_local()
        .shared();

        tracing::trace!(flight = %flight_key, "starting request");
        self.inner
            .in_flight
            .borrow_mut()
            .insert(flight_key, shared.clone());
        shared
    }

    fn attach(
        &self,
        key: &str,
        options: &QueryOptions,
        profile: &CacheProfile,
    ) -> Option<ListenerGuard> {
        if options.websocket_topics.is_empty() {
            return None;
        }
        Some(self.inner.realtime.setup_listeners(
            key,
            &options.websocket_topics,
            options.update_strategy,
            profile,
        ))
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("in_flight", &self.in_flight_count())
            .field("environment", &self.inner.profiles.environment())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use futures::channel::oneshot;
    use futures::executor::{block_on, LocalPool};
    use futures::task::LocalSpawnExt;
    use querycast_core::{Environment, ManualClock, ManualTimer};
    use std::cell::Cell;

    struct Fixture {
        executor: QueryExecutor,
        cache: Rc<CacheManager>,
        clock: ManualClock,
        transport: Rc<LocalTransport>,
    }

    fn fixture(env: Environment) -> Fixture {
        let clock = ManualClock::new(0);
        let cache = Rc::new(CacheManager::new(
            Rc::new(clock.clone()),
            Rc::new(ManualTimer::with_clock(clock.clone())),
        ));
        let transport = Rc::new(LocalTransport::new());
        let realtime = RealtimeManager::new(cache.clone(), transport.clone(), "id");
        let executor =
            QueryExecutor::new(cache.clone(), realtime, ProfileTable::for_environment(env));
        Fixture {
            executor,
            cache,
            clock,
            transport,
        }
    }

    fn counted<T: Clone + 'static>(
        calls: &Rc<Cell<usize>>,
        value: T,
    ) -> impl FnOnce() -> LocalBoxFuture<'static, Result<T>> {
        let calls = calls.clone();
        move || {
            calls.set(calls.get() + 1);
            async move { Ok(value) }.boxed_local()
        }
    }

    #[test]
    fn test_miss_fetches_and_writes() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let options = QueryOptions::new(StrategyName::Static);

        let outcome = block_on(f.executor.execute_query("profile:1", counted(&calls, 42u32), &options))
            .unwrap();

        assert_eq!(outcome.data, 42);
        assert_eq!(outcome.source, DataSource::Network);
        assert!(outcome.listeners.is_none());
        assert_eq!(calls.get(), 1);
        assert_eq!(f.cache.get_value("profile:1"), Some(json!(42)));
        assert_eq!(f.cache.get_entry("profile:1").unwrap().ttl, Some(86_400_000));
        assert_eq!(f.executor.in_flight_count(), 0);
    }

    #[test]
    fn test_fresh_hit_skips_fetcher() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let options = QueryOptions::new(StrategyName::Static);
        f.cache.set_value("profile:1", json!(7), None);

        let outcome = block_on(f.executor.execute_query("profile:1", counted(&calls, 0u32), &options))
            .unwrap();

        assert_eq!(outcome.data, 7);
        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_critical_profile_refetch_window() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let options = QueryOptions::new(StrategyName::Critical);

        block_on(f.executor.execute_query("balance", counted(&calls, 1u32), &options)).unwrap();

        f.clock.advance(5_000);
        let outcome =
            block_on(f.executor.execute_query("balance", counted(&calls, 2u32), &options)).unwrap();
        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(outcome.data, 1);
        assert_eq!(calls.get(), 1);

        f.clock.advance(10_000);
        let outcome =
            block_on(f.executor.execute_query("balance", counted(&calls, 3u32), &options)).unwrap();
        assert_eq!(outcome.source, DataSource::Network);
        assert_eq!(outcome.data, 3);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_test_environment_always_fetches() {
        let f = fixture(Environment::Test);
        let calls = Rc::new(Cell::new(0));
        let options = QueryOptions::new(StrategyName::Static);

        block_on(f.executor.execute_query("k", counted(&calls, 1u32), &options)).unwrap();
        block_on(f.executor.execute_query("k", counted(&calls, 1u32), &options)).unwrap();

        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_single_flight_shares_one_fetch() {
        let f = fixture(Environment::Production);
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let calls = Rc::new(Cell::new(0));
        let results = Rc::new(RefCell::new(Vec::new()));
        let (tx, rx) = oneshot::channel::<Result<u32>>();
        let gate = Rc::new(RefCell::new(Some(rx)));
        let options = QueryOptions::new(StrategyName::Realtime);

        for _ in 0..2 {
            let executor = f.executor.clone();
            let options = options.clone();
            let results = results.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            spawner
                .spawn_local(async move {
                    let fetcher = move || {
                        calls.set(calls.get() + 1);
                        let rx = gate.borrow_mut().take();
                        async move {
                            match rx {
                                Some(rx) => rx
                                    .await
                                    .unwrap_or_else(|_| Err(QueryError::fetch("dropped"))),
                                None => Ok(99),
                            }
                        }
                    };
                    let outcome = executor.execute_query("feed", fetcher, &options).await;
                    results.borrow_mut().push(outcome.map(|o| o.data));
                })
                .unwrap();
        }

        pool.run_until_stalled();
        assert_eq!(calls.get(), 1);
        assert!(f.executor.is_fetching("feed"));
        assert!(f.cache.is_pinned("feed"));

        tx.send(Ok(5)).unwrap();
        pool.run_until_stalled();

        assert_eq!(*results.borrow(), vec![Ok(5), Ok(5)]);
        assert_eq!(f.executor.in_flight_count(), 0);
        assert!(!f.cache.is_pinned("feed"));
        assert_eq!(f.cache.get_value("feed"), Some(json!(5)));
    }

    #[test]
    fn test_fetch_failure_writes_nothing() {
        let f = fixture(Environment::Production);
        let options = QueryOptions::default();

        let result = block_on(f.executor.execute_query::<u32, _, _>(
            "k",
            || async { Err(QueryError::fetch("offline")) },
            &options,
        ));

        assert_eq!(result.unwrap_err(), QueryError::Fetch("offline".into()));
        assert!(!f.cache.contains("k"));
        assert_eq!(f.executor.in_flight_count(), 0);
    }

    #[test]
    fn test_listeners_attached_on_hit_and_fetch() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let options = QueryOptions::new(StrategyName::Realtime)
            .with_topic("post:1")
            .with_update_strategy(UpdateStrategy::Merge);

        let first = block_on(f.executor.execute_query(
            "post:1",
            counted(&calls, json!({"likes": 0})),
            &options,
        ))
        .unwrap();
        let second = block_on(f.executor.execute_query(
            "post:1",
            counted(&calls, json!({"likes": 0})),
            &options,
        ))
        .unwrap();

        assert!(first.listeners.is_some());
        assert_eq!(second.source, DataSource::Cache);
        assert_eq!(f.executor.realtime().consumer_count("post:1", "post:1"), 2);

        f.transport.deliver("post:1", &json!({"contentId": "1", "likes": 5}));
        assert_eq!(f.cache.get_value("post:1"), Some(json!({"likes": 5})));

        drop(first);
        drop(second);
        assert_eq!(f.executor.realtime().route_count(), 0);
    }

    #[test]
    fn test_optimistic_mutation_rolls_back_exactly() {
        let f = fixture(Environment::Production);
        f.cache.set_value("post:1", json!({"likes": 1}), Some(1_000));
        f.clock.advance(10);
        let before = f.cache.get_entry("post:1");

        let options = MutationOptions::new().with_optimistic_update(OptimisticUpdate::new(
            "post:1",
            |current: Option<Value>, delta: &i64| {
                let likes = current.and_then(|v| v["likes"].as_i64()).unwrap_or(0);
                json!({ "likes": likes + delta })
            },
        ));

        let pending = f.executor.execute_mutation(
            1i64,
            |_| async { Err::<Value, _>(QueryError::fetch("rejected")) },
            &options,
        );
        assert_eq!(f.cache.get_value("post:1"), Some(json!({"likes": 2})));

        let result = block_on(pending);

        assert_eq!(result.unwrap_err(), QueryError::Fetch("rejected".into()));
        assert_eq!(f.cache.get_entry("post:1"), before);
    }

    #[test]
    fn test_optimistic_rollback_restores_absence() {
        let f = fixture(Environment::Production);
        let options = MutationOptions::new()
            .with_optimistic_update(OptimisticUpdate::new("draft", |_, v: &String| json!(v)));

        let result = block_on(f.executor.execute_mutation(
            "hello".to_string(),
            |_| async { Err::<(), _>(QueryError::fetch("nope")) },
            &options,
        ));

        assert!(result.is_err());
        assert!(!f.cache.contains("draft"));
    }

    #[test]
    fn test_dropped_mutation_restores_snapshot() {
        let f = fixture(Environment::Production);
        f.cache.set_value("post:1", json!({"likes": 1}), Some(1_000));
        let before = f.cache.get_entry("post:1");
        let (_tx, rx) = oneshot::channel::<()>();

        let options = MutationOptions::new().with_optimistic_update(OptimisticUpdate::new(
            "post:1",
            |_, likes: &i64| json!({ "likes": likes }),
        ));
        let pending = f.executor.execute_mutation(
            2i64,
            |_| async move {
                let _ = rx.await;
                Ok(json!({"likes": 2}))
            },
            &options,
        );
        assert_eq!(f.cache.get_value("post:1"), Some(json!({"likes": 2})));

        drop(pending);

        assert_eq!(f.cache.get_entry("post:1"), before);
        assert!(!f.cache.is_pinned("post:1"));
    }

    #[test]
    fn test_mutation_success_reconciles() {
        let f = fixture(Environment::Production);
        f.cache.set_value("feed", json!([]), None);
        let options = MutationOptions::<String>::new()
            .invalidates("feed")
            .emits("posts")
            .writes_to("post:9", Some(5_000));

        let result = block_on(f.executor.execute_mutation(
            "text".to_string(),
            |text| async move { Ok(json!({"id": 9, "text": text})) },
            &options,
        ))
        .unwrap();

        assert_eq!(result["id"], 9);
        assert!(!f.cache.contains("feed"));
        assert_eq!(f.cache.get_value("post:9"), Some(result.clone()));
        assert_eq!(
            f.transport.published(),
            vec![(
                "posts".to_string(),
                json!({"type": "mutation", "data": {"id": 9, "text": "text"}})
            )]
        );
    }

    fn page_fetcher(
        calls: &Rc<Cell<usize>>,
    ) -> impl Fn(Value) -> LocalBoxFuture<'static, Result<PageResponse<u32>>> {
        let calls = calls.clone();
        move |param: Value| {
            calls.set(calls.get() + 1);
            let page = match param.as_i64() {
                Some(1) => PageResponse::new(vec![1, 2], true),
                Some(2) => PageResponse::new(vec![3], false).with_previous(true),
                Some(0) => PageResponse::new(vec![0], true),
                _ => PageResponse::new(vec![], false),
            };
            async move { Ok(page) }.boxed_local()
        }
    }

    #[test]
    fn test_infinite_query_accumulates_pages() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let fetch = page_fetcher(&calls);
        let options = QueryOptions::new(StrategyName::UserContent);

        let first = block_on(f.executor.execute_infinite_query("feed", json!(1), &fetch, &options))
            .unwrap();
        assert_eq!(first.data.pages, vec![vec![1, 2]]);
        assert!(first.data.has_next_page);

        let data = block_on(f.executor.fetch_next_page("feed", &fetch, &options)).unwrap();
        assert_eq!(data.pages, vec![vec![1, 2], vec![3]]);
        assert_eq!(data.page_params, vec![json!(1), json!(2)]);
        assert!(!data.has_next_page);

        // Nothing left to fetch.
        let again = block_on(f.executor.fetch_next_page("feed", &fetch, &options)).unwrap();
        assert_eq!(again, data);
        assert_eq!(calls.get(), 2);

        let cached: InfiniteData<u32> = f.cache.get("feed").unwrap();
        assert_eq!(cached.items().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_infinite_query_previous_page() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let fetch = page_fetcher(&calls);
        let options = QueryOptions::default();

        block_on(f.executor.execute_infinite_query("feed", json!(2), &fetch, &options)).unwrap();
        let data = block_on(f.executor.fetch_previous_page("feed", &fetch, &options)).unwrap();

        assert_eq!(data.pages, vec![vec![1, 2], vec![3]]);
        assert_eq!(data.page_params, vec![json!(1), json!(2)]);
        assert!(!data.has_previous_page);
    }

    #[test]
    fn test_next_page_single_flight() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let options = QueryOptions::default();
        block_on(f.executor.execute_infinite_query(
            "feed",
            json!(1),
            page_fetcher(&calls),
            &options,
        ))
        .unwrap();

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let (tx, rx) = oneshot::channel::<()>();
        let gate = Rc::new(RefCell::new(Some(rx)));
        let results = Rc::new(RefCell::new(Vec::new()));

        for _ in 0..2 {
            let executor = f.executor.clone();
            let options = options.clone();
            let results = results.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            spawner
                .spawn_local(async move {
                    let fetcher = move |_param: Value| {
                        calls.set(calls.get() + 1);
                        let rx = gate.borrow_mut().take();
                        async move {
                            if let Some(rx) = rx {
                                let _ = rx.await;
                            }
                            Ok(PageResponse::new(vec![3u32], false))
                        }
                    };
                    let data = executor.fetch_next_page("feed", fetcher, &options).await;
                    results.borrow_mut().push(data.map(|d| d.pages));
                })
                .unwrap();
        }

        pool.run_until_stalled();
        assert_eq!(calls.get(), 2);
        tx.send(()).unwrap();
        pool.run_until_stalled();

        let expected: Vec<Vec<u32>> = vec![vec![1, 2], vec![3]];
        assert_eq!(*results.borrow(), vec![Ok(expected.clone()), Ok(expected)]);
    }

    #[test]
    fn test_page_after_invalidation_writes_nothing() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let options = QueryOptions::default();
        block_on(f.executor.execute_infinite_query(
            "feed",
            json!(1),
            page_fetcher(&calls),
            &options,
        ))
        .unwrap();

        let mut pool = LocalPool::new();
        let (tx, rx) = oneshot::channel::<()>();
        let result = Rc::new(RefCell::new(None));

        let executor = f.executor.clone();
        let out = result.clone();
        pool.spawner()
            .spawn_local(async move {
                let fetcher = move |_: Value| async move {
                    let _ = rx.await;
                    Ok(PageResponse::new(vec![3u32], false))
                };
                *out.borrow_mut() = Some(executor.fetch_next_page("feed", fetcher, &options).await);
            })
            .unwrap();

        pool.run_until_stalled();
        f.cache.invalidate("feed");
        tx.send(()).unwrap();
        pool.run_until_stalled();

        assert_eq!(
            result.borrow_mut().take().unwrap().unwrap_err(),
            QueryError::Invalidated("feed".into())
        );
        assert!(!f.cache.contains("feed"));
    }

    #[test]
    fn test_next_page_without_entry() {
        let f = fixture(Environment::Production);
        let calls = Rc::new(Cell::new(0));
        let result = block_on(f.executor.fetch_next_page(
            "missing",
            page_fetcher(&calls),
            &QueryOptions::default(),
        ));
        assert!(matches!(result, Err(QueryError::Invalidated(_))));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_page_params_from_cursor() {
        let data = InfiniteData::first(
            json!("a"),
            PageResponse::new(vec![1u32], true)
                .with_next_cursor("b")
                .with_previous_cursor("z"),
        );
        assert_eq!(data.next_page_param(), Some(json!("b")));
        assert_eq!(data.previous_page_param(), Some(json!("z")));

        let numeric = InfiniteData::first(json!(3), PageResponse::new(vec![1u32], true));
        assert_eq!(numeric.next_page_param(), Some(json!(4)));
        assert_eq!(numeric.previous_page_param(), Some(json!(2)));

        let opaque = InfiniteData::first(json!("x"), PageResponse::new(vec![1u32], true));
        assert_eq!(opaque.next_page_param(), None);
    }

    #[test]
    fn test_infinite_data_serializes_as_pages() {
        let data = InfiniteData::first(json!(1), PageResponse::new(vec![1u32, 2], true));
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["pages"], json!([[1, 2]]));
        assert_eq!(value["hasNextPage"], json!(true));
        assert!(querycast_core::strategy::is_paginated(&value));
    }

    #[test]
    fn test_options_resolve_overrides() {
        let profiles = ProfileTable::for_environment(Environment::Production);
        let resolved = QueryOptions::new(StrategyName::Critical)
            .with_stale_time(1)
            .resolve(&profiles);
        assert_eq!(resolved.stale_time_ms, 1);
        assert_eq!(resolved.cache_time_ms, 60_000);
        assert_eq!(resolved.refetch_interval_ms, Some(30_000));
    }
}
