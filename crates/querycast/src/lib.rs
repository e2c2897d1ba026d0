//! Querycast: WASM-first query orchestration.
//!
//! Cached queries, mutations with optimistic updates, and infinite
//! queries, kept live over realtime topics and exposed to UI trees through
//! hook adapters.
//!
//! ```ignore
//! use querycast::{QueryClient, QueryOptions, StrategyName};
//!
//! let client = QueryClient::builder().build();
//! let feed = client.use_query(
//!     "feed",
//!     || async { Ok(vec![1, 2, 3]) },
//!     QueryOptions::new(StrategyName::Realtime).with_topic("feed"),
//! );
//! feed.on_change(|| request_render());
//! ```

#![allow(clippy::type_complexity)]

pub mod client;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod realtime;
pub mod transport;

#[cfg(target_arch = "wasm32")]
pub mod browser;

pub use querycast_core::*;

pub use client::{QueryClient, QueryClientBuilder};
pub use error::{QueryError, Result};
pub use executor::{
    CacheWrite, DataSource, InfiniteData, MutationOptions, OptimisticUpdate, PageDirection,
    PageResponse, QueryExecutor, QueryOptions, QueryOutcome,
};
pub use hooks::{
    ChangeCallback, Fetcher, HookContext, InfiniteQueryHook, MutateFn, MutationHook, PageFetcher,
    QueryHook, QueryStatus,
};
pub use realtime::{ListenerGuard, RealtimeManager, SubscriptionState};
pub use transport::{LocalTransport, MessageHandler, RealtimeTransport, TopicSubscription};

#[cfg(target_arch = "wasm32")]
pub use browser::{BrowserSpawner, DateClock, IntervalTimer, WebSocketError, WebSocketTransport};
