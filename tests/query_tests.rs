/// Query binding tests
///
/// QueryOne / QueryMany / QueryFragment lifecycles over the in-memory cache
/// Run with: cargo test --test query_tests
mod common;

use common::{FakeServer, Folder, Todo, cache, manager, todo_json};
use entity_query::query::{InMemoryQueryCache, QueryCacheConfig};
use entity_query::{
    CacheError, InvalidateFilter, QueryCache, QueryFragment, QueryKey, QueryMany, QueryOne,
    QueryOptions, QueryState, QueryStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_query_many_hydrates_in_server_order() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(2, "b"), todo_json(1, "a"), todo_json(2, "b")]));

    let todos = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    assert_eq!(todos.status(), QueryStatus::Idle);

    let listed = todos.fetch().await.unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed[0].ptr_eq(&listed[2]));
    assert_eq!(todos.status(), QueryStatus::Ready);
    assert!(!todos.is_fetching());
    assert!(matches!(todos.state(), QueryState::Ready(ref items) if items.len() == 3));
}

#[tokio::test]
async fn test_bindings_share_instances() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a"), todo_json(2, "b")]));
    server.serve(["todo", "1"], todo_json(1, "a"));

    let todos = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", server.fetcher()));
    let detail = QueryOne::<Todo>::new(&manager, cache, QueryOptions::new(["todo", "1"], server.fetcher()));
    todos.fetch().await.unwrap();
    let one = detail.fetch().await.unwrap().unwrap();

    assert!(one.ptr_eq(&todos.entities()[0]));

    // An edit through one binding is visible through the other
    one.set("title", "edited").unwrap();
    assert_eq!(todos.entities()[0].get("title"), Some(json!("edited")));
}

#[tokio::test]
async fn test_dispose_releases_entities() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a"), todo_json(2, "b")]));

    let todos = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", server.fetcher()));
    todos.fetch().await.unwrap();
    assert_eq!(cache.observer_count(&QueryKey::from("todos")), 1);

    todos.dispose();
    assert!(todos.is_disposed());
    assert!(manager.get::<Todo>(&1).is_none());
    assert!(manager.get::<Todo>(&2).is_none());
    assert_eq!(cache.observer_count(&QueryKey::from("todos")), 0);
    // The expired payload left with its last observer
    assert_eq!(cache.entry_count(), 0);

    let err = todos.fetch().await.unwrap_err();
    assert!(matches!(err, CacheError::Disposed(_)));
}

#[tokio::test]
async fn test_drop_disposes_binding() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a")]));

    let todos = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    let copy = todos.clone();
    todos.fetch().await.unwrap();

    drop(todos);
    assert!(manager.get::<Todo>(&1).is_some());
    drop(copy);
    assert!(manager.get::<Todo>(&1).is_none());
}

#[tokio::test]
async fn test_shared_key_released_by_last_binding() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a")]));
    let key = QueryKey::from("todos");

    let first = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", server.fetcher()));
    first.fetch().await.unwrap();
    // A second binding on a filled key starts out ready
    let second = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    assert_eq!(second.status(), QueryStatus::Ready);
    assert_eq!(second.len(), 1);
    assert_eq!(manager.key_claims(&key), 2);

    first.dispose();
    assert!(manager.get::<Todo>(&1).is_some());
    assert_eq!(second.len(), 1);

    second.dispose();
    assert!(manager.get::<Todo>(&1).is_none());
    assert_eq!(manager.key_claims(&key), 0);
}

#[tokio::test]
async fn test_dispose_during_fetch_defers_release() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a")]));
    let key = QueryKey::from("todos");

    let todos = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    let gate = server.hold_next_fetch();

    let (fetched, ()) = tokio::join!(todos.fetch(), async {
        tokio::task::yield_now().await;
        assert!(todos.is_fetching());
        todos.dispose();
        // Still claimed while the fetch is in flight
        assert_eq!(manager.key_claims(&key), 1);
        gate.notify_one();
    });

    // The late response is discarded and nothing is left behind
    assert!(matches!(fetched, Err(CacheError::Disposed(_))));
    assert!(manager.get::<Todo>(&1).is_none());
    assert_eq!(manager.key_claims(&key), 0);
    assert!(!todos.is_fetching());
}

#[tokio::test]
async fn test_concurrent_bindings_share_one_instance() {
    let (manager, cache) = (manager(), cache());
    let (all_server, open_server) = (FakeServer::new(), FakeServer::new());
    all_server.serve("todos", json!([todo_json(1, "a"), todo_json(2, "b")]));
    open_server.serve(["todos", "open"], json!([todo_json(2, "b")]));

    let all = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", all_server.fetcher()));
    let open = QueryMany::<Todo>::new(
        &manager,
        cache,
        QueryOptions::new(["todos", "open"], open_server.fetcher()),
    );
    let all_gate = all_server.hold_next_fetch();
    let open_gate = open_server.hold_next_fetch();

    // Both responses land in the same tick
    let (all_fetched, open_fetched, ()) = tokio::join!(all.fetch(), open.fetch(), async {
        tokio::task::yield_now().await;
        assert!(all.is_fetching() && open.is_fetching());
        assert!(manager.get::<Todo>(&2).is_none());
        all_gate.notify_one();
        open_gate.notify_one();
    });

    let (all_fetched, open_fetched) = (all_fetched.unwrap(), open_fetched.unwrap());
    assert!(all_fetched[1].ptr_eq(&open_fetched[0]));
    assert!(manager.get::<Todo>(&2).unwrap().ptr_eq(&open_fetched[0]));
    assert_eq!(manager.ref_count::<Todo>(&2), 2);
    assert_eq!(manager.len(), 2);
}

#[tokio::test]
async fn test_fetch_failure_surfaces_state() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());

    let todos = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    let err = todos.fetch().await.unwrap_err();

    assert!(matches!(err, CacheError::Fetch { .. }));
    assert_eq!(todos.status(), QueryStatus::Failed);
    assert_eq!(todos.error(), Some(err.clone()));
    assert!(matches!(todos.state(), QueryState::Failed(_)));
    assert!(todos.is_empty());

    // A later success clears the error
    server.serve("todos", json!([todo_json(1, "a")]));
    todos.fetch().await.unwrap();
    assert_eq!(todos.status(), QueryStatus::Ready);
    assert!(todos.error().is_none());
}

#[tokio::test]
async fn test_invalid_list_payload() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", todo_json(1, "not a list"));

    let todos = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    let err = todos.fetch().await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidPayload { .. }));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_select_reads_envelope() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!({"items": [todo_json(1, "a")], "total": 1}));

    let options = QueryOptions::new("todos", server.fetcher()).select_field("items");
    let todos = QueryMany::<Todo>::new(&manager, cache, options);
    assert_eq!(todos.fetch().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_query_one_null_payload() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve(["todo", "1"], todo_json(1, "a"));

    let detail = QueryOne::<Todo>::new(&manager, cache, QueryOptions::new(["todo", "1"], server.fetcher()));
    assert!(detail.fetch().await.unwrap().is_some());

    // The record vanished server-side
    server.serve(["todo", "1"], json!(null));
    assert!(detail.refetch().await.unwrap().is_none());
    assert_eq!(detail.status(), QueryStatus::Ready);
    assert!(manager.get::<Todo>(&1).is_none());
}

#[tokio::test]
async fn test_invalidate_refetches_and_keeps_edits() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a"), todo_json(2, "b")]));

    let todos = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", server.fetcher()));
    let listed = todos.fetch().await.unwrap();
    listed[0].set("title", "mine").unwrap();

    server.serve("todos", json!([todo_json(1, "server a"), todo_json(2, "server b")]));
    let keys = cache.invalidate(InvalidateFilter::Prefix(QueryKey::from("todos"))).await;
    assert_eq!(keys, vec![QueryKey::from("todos")]);
    assert_eq!(server.fetch_count(), 2);

    assert_eq!(listed[0].get("title"), Some(json!("mine")));
    assert_eq!(listed[0].clean_value("title"), Some(json!("server a")));
    assert_eq!(listed[1].get("title"), Some(json!("server b")));
}

#[tokio::test]
async fn test_failed_invalidation_refetch_surfaces_state() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a")]));

    let todos = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", server.fetcher()));
    todos.fetch().await.unwrap();

    server.serve("todos", todo_json(1, "not a list"));
    cache.invalidate(InvalidateFilter::Key(QueryKey::from("todos"))).await;

    assert_eq!(todos.status(), QueryStatus::Failed);
    assert!(matches!(todos.error(), Some(CacheError::InvalidPayload { .. })));
    // The last good list stays in place
    assert_eq!(todos.len(), 1);
    assert!(manager.get::<Todo>(&1).is_some());
}

#[tokio::test]
async fn test_refetch_drops_missing_entities() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a"), todo_json(2, "b")]));

    let todos = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    todos.fetch().await.unwrap();

    server.serve("todos", json!([todo_json(2, "b")]));
    let listed = todos.refetch().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(manager.get::<Todo>(&1).is_none());
}

#[tokio::test]
async fn test_fresh_data_served_from_cache() {
    let manager = manager();
    let server = FakeServer::new();
    let cache = Arc::new(
        InMemoryQueryCache::new(QueryCacheConfig::new().stale_time(Duration::from_secs(60))).unwrap(),
    );
    server.serve("todos", json!([todo_json(1, "a")]));

    let todos = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", server.fetcher()));
    todos.fetch().await.unwrap();
    todos.fetch().await.unwrap();

    assert_eq!(server.fetch_count(), 1);
    assert_eq!(cache.stats().fetch_hits, 1);
}

#[tokio::test]
async fn test_subscription_follows_status() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([todo_json(1, "a")]));

    let todos = QueryMany::<Todo>::new(&manager, cache, QueryOptions::new("todos", server.fetcher()));
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let sub = todos.subscribe(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    todos.fetch().await.unwrap();
    assert!(hits.load(Ordering::SeqCst) > 0);

    sub.unsubscribe();
    let before = hits.load(Ordering::SeqCst);
    todos.refetch().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), before);
}

fn folder_json() -> serde_json::Value {
    json!({
        "id": "f1",
        "name": "Inbox",
        "todos": [todo_json(1, "a"), todo_json(2, "b")]
    })
}

#[tokio::test]
async fn test_fragment_seeded_from_parent() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve(["folder", "f1"], folder_json());

    let folder = QueryOne::<Folder>::new(&manager, cache.clone(), QueryOptions::new(["folder", "f1"], server.fetcher()));
    let parent = folder.fetch().await.unwrap().unwrap();

    let todos = QueryFragment::<Todo>::attach(&manager, cache, &parent, "todos", server.fetcher()).unwrap();
    assert!(todos.is_seeded());
    assert!(todos.is_parent_alive());
    assert_eq!(todos.key(), &QueryKey::fragment("folder", "f1", "todos"));
    assert!(matches!(todos.state(), QueryState::Ready(ref items) if items.len() == 2));
}

#[tokio::test]
async fn test_fragment_refreshes_alone() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve(["folder", "f1"], folder_json());
    server.serve(QueryKey::fragment("folder", "f1", "todos"), json!([todo_json(3, "c")]));

    let folder = QueryOne::<Folder>::new(&manager, cache.clone(), QueryOptions::new(["folder", "f1"], server.fetcher()));
    let parent = folder.fetch().await.unwrap().unwrap();
    let todos = QueryFragment::<Todo>::attach(&manager, cache, &parent, "todos", server.fetcher()).unwrap();

    let listed = todos.refetch().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id(), 3);
    // Only the fragment went to the server again
    assert_eq!(server.fetch_count(), 2);
    assert!(manager.get::<Todo>(&1).is_none());
    assert!(folder.entity().unwrap().ptr_eq(&parent));
}

#[tokio::test]
async fn test_fragment_goes_with_parent() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve(["folder", "f1"], folder_json());

    let folder = QueryOne::<Folder>::new(&manager, cache.clone(), QueryOptions::new(["folder", "f1"], server.fetcher()));
    let parent = folder.fetch().await.unwrap().unwrap();
    let todos = QueryFragment::<Todo>::attach(&manager, cache, &parent, "todos", server.fetcher()).unwrap();

    folder.dispose();
    assert!(!todos.is_parent_alive());
    assert!(todos.entities().is_empty());
    assert!(manager.get::<Todo>(&1).is_none());
    assert!(matches!(todos.fetch().await, Err(CacheError::EntityNotFound { .. })));
}

#[tokio::test]
async fn test_fragment_must_be_declared() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve(["folder", "f1"], folder_json());
    let folder = QueryOne::<Folder>::new(&manager, cache.clone(), QueryOptions::new(["folder", "f1"], server.fetcher()));
    let parent = folder.fetch().await.unwrap().unwrap();

    let unknown = QueryFragment::<Todo>::attach(&manager, cache.clone(), &parent, "notes", server.fetcher());
    assert!(matches!(unknown, Err(CacheError::UnknownField { .. })));

    let wrong_child = QueryFragment::<Folder>::attach(&manager, cache, &parent, "todos", server.fetcher());
    assert!(matches!(wrong_child, Err(CacheError::TypeMismatch(_))));
}

#[tokio::test]
async fn test_cache_tracks_active_keys() {
    let (manager, cache, server) = (manager(), cache(), FakeServer::new());
    server.serve("todos", json!([]));
    let todos = QueryMany::<Todo>::new(&manager, cache.clone(), QueryOptions::new("todos", server.fetcher()));
    todos.fetch().await.unwrap();

    assert!(cache.active_keys_for_entity_type("todo").contains(&QueryKey::from("todos")));
    assert!(cache.active_keys_for_entity_type("folder").is_empty());
    todos.dispose();
    assert!(cache.active_keys().is_empty());
}
