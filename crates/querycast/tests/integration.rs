//! End-to-end tests through `QueryClient`.
//!
//! Background work runs on the client-owned pool; time is driven by a
//! shared `ManualClock` / `ManualTimer` pair.

use futures::channel::oneshot;
use querycast::{
    DataSource, Environment, LocalTransport, ManualClock, ManualTimer, MutationOptions,
    OptimisticUpdate, PageResponse, QueryClient, QueryConfig, QueryError, QueryOptions,
    QueryStatus, StrategyName, UpdateStrategy,
};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct Harness {
    client: QueryClient,
    clock: ManualClock,
    timer: ManualTimer,
    transport: Rc<LocalTransport>,
}

fn harness(config: QueryConfig) -> Harness {
    let clock = ManualClock::new(1_000_000);
    let timer = ManualTimer::with_clock(clock.clone());
    let transport = Rc::new(LocalTransport::new());
    let client = QueryClient::builder()
        .config(config)
        .clock(Rc::new(clock.clone()))
        .timer(Rc::new(timer.clone()))
        .transport(transport.clone())
        .build();
    Harness {
        client,
        clock,
        timer,
        transport,
    }
}

fn counter() -> (Rc<Cell<u32>>, impl Fn() -> futures::future::Ready<querycast::Result<u32>>) {
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();
    let fetch = move || {
        c.set(c.get() + 1);
        futures::future::ready(Ok(c.get()))
    };
    (calls, fetch)
}

// =============================================================================
// Queries
// =============================================================================

#[test]
fn test_critical_profile_freshness_window() {
    let h = harness(QueryConfig::default().with_cleanup_interval(0));
    let executor = h.client.executor().clone();
    let options = QueryOptions::new(StrategyName::Critical);
    let calls = Rc::new(Cell::new(0));

    let read = |calls: &Rc<Cell<u32>>| {
        let calls = calls.clone();
        futures::executor::block_on(executor.execute_query(
            "quote",
            move || {
                calls.set(calls.get() + 1);
                futures::future::ready(Ok(calls.get()))
            },
            &options,
        ))
        .expect("query")
    };

    assert_eq!(read(&calls).source, DataSource::Network);

    h.clock.advance(5_000);
    let cached = read(&calls);
    assert_eq!(cached.source, DataSource::Cache);
    assert_eq!(cached.data, 1);

    h.clock.advance(10_000);
    let refreshed = read(&calls);
    assert_eq!(refreshed.source, DataSource::Network);
    assert_eq!(refreshed.data, 2);
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_concurrent_hooks_single_flight() {
    let h = harness(QueryConfig::default());
    let calls = Rc::new(Cell::new(0));
    let (tx, rx) = oneshot::channel::<Vec<u32>>();
    let gate = Rc::new(RefCell::new(Some(rx)));

    let make_fetcher = || {
        let calls = calls.clone();
        let gate = gate.clone();
        move || {
            calls.set(calls.get() + 1);
            let rx = gate.borrow_mut().take();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(QueryError::fetch),
                    None => Err(QueryError::fetch("gate already taken")),
                }
            }
        }
    };
    let options = QueryOptions::new(StrategyName::UserContent);
    let first = h.client.use_query("feed", make_fetcher(), options.clone());
    let second = h.client.use_query("feed", make_fetcher(), options);
    h.client.run_until_stalled();

    assert!(first.is_loading());
    assert!(second.is_loading());
    assert!(h.client.executor().is_fetching("feed"));

    tx.send(vec![1, 2, 3]).expect("receiver alive");
    h.client.run_until_stalled();

    assert_eq!(calls.get(), 1);
    assert_eq!(first.data(), Some(vec![1, 2, 3]));
    assert_eq!(second.data(), Some(vec![1, 2, 3]));
    assert_eq!(h.client.executor().in_flight_count(), 0);
}

#[test]
fn test_error_is_distinct_from_empty_success() {
    let h = harness(QueryConfig::default());
    let failing = h.client.use_query(
        "broken",
        || futures::future::ready(Err::<Vec<u32>, _>(QueryError::fetch("500"))),
        QueryOptions::new(StrategyName::Static),
    );
    let empty = h.client.use_query(
        "empty",
        || futures::future::ready(Ok(Vec::<u32>::new())),
        QueryOptions::new(StrategyName::Static),
    );
    h.client.run_until_stalled();

    assert_eq!(failing.status(), QueryStatus::Error);
    assert_eq!(failing.error(), Some(QueryError::Fetch("500".to_string())));
    assert!(!h.client.cache().contains("broken"));

    assert_eq!(empty.status(), QueryStatus::Success);
    assert_eq!(empty.data(), Some(Vec::new()));
}

#[test]
fn test_test_environment_always_refetches() {
    let h = harness(QueryConfig::for_environment(Environment::Test));
    let (calls, fetch) = counter();
    let executor = h.client.executor();
    let options = QueryOptions::new(StrategyName::Static);

    futures::executor::block_on(executor.execute_query("k", &fetch, &options)).expect("first");
    futures::executor::block_on(executor.execute_query("k", &fetch, &options)).expect("second");

    assert_eq!(calls.get(), 2);
}

// =============================================================================
// Realtime
// =============================================================================

#[test]
fn test_merge_message_updates_subscribed_entry() {
    let h = harness(QueryConfig::default());
    h.client.cache().set_value("post:1", json!({"likes": 0}), None);

    let hook = h.client.use_query(
        "post:1",
        || futures::future::ready(Ok(json!({"likes": 0}))),
        QueryOptions::new(StrategyName::Realtime)
            .with_topic("posts")
            .with_update_strategy(UpdateStrategy::Merge),
    );
    h.client.run_until_stalled();
    assert_eq!(h.transport.subscriber_count("posts"), 1);

    h.transport.deliver(
        "posts",
        &json!({"type": "merge", "contentId": "1", "likes": 5}),
    );

    assert_eq!(h.client.cache().get_value("post:1"), Some(json!({"likes": 5})));
    assert_eq!(hook.data(), Some(json!({"likes": 5})));
}

#[test]
fn test_shared_route_has_one_transport_handler() {
    let h = harness(QueryConfig::default());
    let options = QueryOptions::new(StrategyName::Realtime)
        .with_topic("chat")
        .with_update_strategy(UpdateStrategy::Append);
    let fetch = || futures::future::ready(Ok(Vec::<Value>::new()));

    let a = h.client.use_query("chat:room", fetch, options.clone());
    let b = h.client.use_query("chat:room", fetch, options);
    h.client.run_until_stalled();
    assert_eq!(h.transport.subscriber_count("chat"), 1);
    assert_eq!(h.client.realtime().consumer_count("chat:room", "chat"), 2);

    h.transport.deliver("chat", &json!({"data": {"id": 1, "text": "hi"}}));
    assert_eq!(
        h.client.cache().get_value("chat:room"),
        Some(json!([{"id": 1, "text": "hi"}]))
    );

    drop(a);
    assert_eq!(h.transport.subscriber_count("chat"), 1);
    drop(b);
    assert_eq!(h.transport.subscriber_count("chat"), 0);
}

// =============================================================================
// Mutations
// =============================================================================

#[test]
fn test_optimistic_mutation_rollback_is_exact() {
    let h = harness(QueryConfig::default());
    let original = json!([{"id": 1, "title": "a"}]);
    h.client.cache().set_value("todos", original.clone(), Some(42_000));
    let before = h.client.cache().get_entry("todos").expect("seeded");

    let mutation = h.client.use_mutation(
        |_todo: Value| futures::future::ready(Err::<Value, _>(QueryError::fetch("conflict"))),
        MutationOptions::new().with_optimistic_update(OptimisticUpdate::new(
            "todos",
            |old: Option<Value>, todo: &Value| {
                let mut list = old.unwrap_or_else(|| json!([]));
                if let Some(items) = list.as_array_mut() {
                    items.push(todo.clone());
                }
                list
            },
        )),
    );

    h.clock.advance(10);
    mutation.mutate(json!({"id": 2, "title": "b"})).expect("spawned");
    assert_eq!(
        h.client.cache().get_value("todos"),
        Some(json!([{"id": 1, "title": "a"}, {"id": 2, "title": "b"}]))
    );

    h.client.run_until_stalled();

    let after = h.client.cache().get_entry("todos").expect("restored");
    assert_eq!(after.data, original);
    assert_eq!(after.timestamp, before.timestamp);
    assert_eq!(after.ttl, before.ttl);
    assert_eq!(mutation.error(), Some(QueryError::fetch("conflict")));
}

#[test]
fn test_mutation_emits_and_invalidates() {
    let h = harness(QueryConfig::default());
    h.client.cache().set_value("profile", json!({"name": "old"}), None);

    let mutation = h.client.use_mutation(
        |name: String| futures::future::ready(Ok(json!({"name": name}))),
        MutationOptions::new()
            .invalidates("profile")
            .emits("profile-updates"),
    );
    let result = futures::executor::block_on(mutation.mutate_async("new".to_string()))
        .expect("mutation");

    assert_eq!(result, json!({"name": "new"}));
    assert!(!h.client.cache().contains("profile"));
    assert_eq!(
        h.transport.published(),
        vec![(
            "profile-updates".to_string(),
            json!({"type": "mutation", "data": {"name": "new"}})
        )]
    );
}

// =============================================================================
// Infinite queries
// =============================================================================

#[test]
fn test_infinite_pages_accumulate_in_order() {
    let h = harness(QueryConfig::default());
    let hook = h.client.use_infinite_query(
        "timeline",
        json!(1),
        |param: Value| {
            let page = match param.as_u64() {
                Some(1) => PageResponse::new(vec![1, 2], true),
                _ => PageResponse::new(vec![3], false),
            };
            futures::future::ready(Ok(page))
        },
        QueryOptions::new(StrategyName::UserContent),
    );
    h.client.run_until_stalled();
    hook.fetch_next_page().expect("spawned");
    h.client.run_until_stalled();

    let data = hook.data().expect("pages");
    assert_eq!(data.pages, vec![vec![1, 2], vec![3]]);
    assert!(!data.has_next_page);
    assert_eq!(data.items().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

    let stored = h.client.cache().get_value("timeline").expect("cached");
    assert_eq!(stored["pages"], json!([[1, 2], [3]]));
}

// =============================================================================
// Cleanup
// =============================================================================

#[test]
fn test_cleanup_evicts_unread_entry_after_two_intervals() {
    let h = harness(QueryConfig::default().with_cleanup_interval(1_000));
    h.client.cache().set_value("ephemeral", json!(1), Some(500));

    h.timer.advance(2_000);

    assert!(!h.client.cache().contains("ephemeral"));
    assert_eq!(h.client.cache().get_stats().evictions, 1);
}
