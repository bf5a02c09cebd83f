/// Entity manager tests
///
/// Identity map uniqueness, reference counting, eviction and re-keying
/// Run with: cargo test --test manager_tests
mod common;

use common::{Folder, Todo, manager, todo_json};
use entity_query::{
    EntityManager, EntityManagerConfig, EvictionPolicy, InsertPosition, QueryKey,
};
use serde_json::json;

#[tokio::test]
async fn test_one_instance_per_identity() {
    let manager = manager();
    let all = QueryKey::from("todos");
    let open = QueryKey::from(["todos", "open"]);

    let first = manager.hydrate::<Todo>(&[todo_json(1, "milk"), todo_json(2, "eggs")], &all).unwrap();
    let second = manager.hydrate::<Todo>(&[todo_json(1, "milk")], &open).unwrap();

    assert!(first[0].ptr_eq(&second[0]));
    assert!(manager.get::<Todo>(&1).unwrap().ptr_eq(&first[0]));
    assert_eq!(manager.ref_count::<Todo>(&1), 2);
    assert_eq!(manager.ref_count::<Todo>(&2), 1);
    assert_eq!(manager.referencers::<Todo>(&1).len(), 2);
    assert_eq!(manager.len(), 2);
}

#[tokio::test]
async fn test_release_evicts_unreferenced() {
    let manager = manager();
    let all = QueryKey::from("todos");
    let open = QueryKey::from(["todos", "open"]);
    manager.hydrate::<Todo>(&[todo_json(1, "milk"), todo_json(2, "eggs")], &all).unwrap();
    manager.hydrate::<Todo>(&[todo_json(1, "milk")], &open).unwrap();

    // Entity 1 is still referenced by the open list
    assert_eq!(manager.release(&all), 1);
    assert!(manager.get::<Todo>(&1).is_some());
    assert!(manager.get::<Todo>(&2).is_none());

    assert_eq!(manager.release(&open), 1);
    assert!(manager.get::<Todo>(&1).is_none());
    assert!(manager.is_empty());
    assert!(manager.query_entities::<Todo>(&open).unwrap().is_none());
}

#[tokio::test]
async fn test_duplicates_kept_in_server_order() {
    let manager = manager();
    let key = QueryKey::from("todos");
    manager
        .hydrate::<Todo>(&[todo_json(2, "b"), todo_json(1, "a"), todo_json(2, "b")], &key)
        .unwrap();

    let listed = manager.query_entities::<Todo>(&key).unwrap().unwrap();
    let ids: Vec<i64> = listed.iter().map(|todo| todo.id()).collect();
    assert_eq!(ids, vec![2, 1, 2]);
    assert!(listed[0].ptr_eq(&listed[2]));
    // A key counts once however often it lists the entity
    assert_eq!(manager.ref_count::<Todo>(&2), 1);
}

#[tokio::test]
async fn test_rehydrate_drops_stale_references() {
    let manager = manager();
    let key = QueryKey::from("todos");
    manager.hydrate::<Todo>(&[todo_json(1, "a"), todo_json(2, "b")], &key).unwrap();
    manager.hydrate::<Todo>(&[todo_json(2, "b")], &key).unwrap();

    assert!(manager.get::<Todo>(&1).is_none());
    assert_eq!(manager.query_entities::<Todo>(&key).unwrap().unwrap().len(), 1);
}

#[tokio::test]
async fn test_deferred_eviction_waits_for_gc() {
    let config = EntityManagerConfig::new().eviction(EvictionPolicy::Deferred);
    let manager = EntityManager::new(config).unwrap();
    let key = QueryKey::from("todos");
    manager.hydrate::<Todo>(&[todo_json(1, "a")], &key).unwrap();

    assert_eq!(manager.release(&key), 0);
    assert!(manager.get::<Todo>(&1).is_some());
    assert_eq!(manager.ref_count::<Todo>(&1), 0);

    assert_eq!(manager.collect_garbage(), 1);
    assert!(manager.get::<Todo>(&1).is_none());
}

#[tokio::test]
async fn test_hold_keeps_entity_alive() {
    let manager = manager();
    let key = QueryKey::from("todos");
    let todo = manager.hydrate::<Todo>(&[todo_json(1, "a")], &key).unwrap().remove(0);

    let hold = manager.hold(&todo).unwrap();
    manager.release(&key);
    assert!(manager.get::<Todo>(&1).is_some());

    drop(hold);
    assert!(manager.get::<Todo>(&1).is_none());
}

#[tokio::test]
async fn test_remove_strips_every_list() {
    let manager = manager();
    let all = QueryKey::from("todos");
    let open = QueryKey::from(["todos", "open"]);
    let todo = manager.hydrate::<Todo>(&[todo_json(1, "a"), todo_json(2, "b")], &all).unwrap().remove(0);
    manager.hydrate::<Todo>(&[todo_json(1, "a")], &open).unwrap();

    assert!(manager.remove::<Todo>(&1).unwrap());
    assert!(todo.is_removed());
    assert!(manager.get::<Todo>(&1).is_none());
    assert_eq!(manager.query_entities::<Todo>(&all).unwrap().unwrap().len(), 1);
    assert!(manager.query_entities::<Todo>(&open).unwrap().unwrap().is_empty());

    // Removing twice is a no-op
    assert!(!manager.remove::<Todo>(&1).unwrap());
}

#[tokio::test]
async fn test_attach_positions() {
    let manager = manager();
    let key = QueryKey::from("todos");
    let other = QueryKey::from("elsewhere");
    manager.hydrate::<Todo>(&[todo_json(1, "a")], &key).unwrap();
    let late = manager.hydrate::<Todo>(&[todo_json(2, "b")], &other).unwrap().remove(0);

    manager.attach(&key, &late, InsertPosition::Start).unwrap();
    let ids: Vec<i64> = manager
        .query_entities::<Todo>(&key)
        .unwrap()
        .unwrap()
        .iter()
        .map(|todo| todo.id())
        .collect();
    assert_eq!(ids, vec![2, 1]);
    assert!(manager.referencers::<Todo>(&2).contains(&key));
}

#[tokio::test]
async fn test_rekey_moves_entity() {
    let manager = manager();
    let key = QueryKey::from("todos");
    let todo = manager.hydrate::<Todo>(&[todo_json(-1, "draft")], &key).unwrap().remove(0);

    let moved = manager.rekey::<Todo>(&-1, &10).unwrap();
    assert!(moved.ptr_eq(&todo));
    assert_eq!(todo.id(), 10);
    assert!(manager.get::<Todo>(&-1).is_none());
    assert!(manager.get::<Todo>(&10).unwrap().ptr_eq(&todo));

    let listed = manager.query_entities::<Todo>(&key).unwrap().unwrap();
    assert_eq!(listed[0].id(), 10);
}

#[tokio::test]
async fn test_rekey_merges_into_live_instance() {
    let manager = manager();
    let drafts = QueryKey::from("drafts");
    let all = QueryKey::from("todos");
    let draft = manager.hydrate::<Todo>(&[todo_json(-1, "draft")], &drafts).unwrap().remove(0);
    let live = manager.hydrate::<Todo>(&[todo_json(10, "saved")], &all).unwrap().remove(0);

    let merged = manager.rekey::<Todo>(&-1, &10).unwrap();
    assert!(merged.ptr_eq(&live));
    assert!(draft.is_removed());
    assert_eq!(manager.len(), 1);
    assert_eq!(manager.ref_count::<Todo>(&10), 2);

    let listed = manager.query_entities::<Todo>(&drafts).unwrap().unwrap();
    assert!(listed[0].ptr_eq(&live));
}

#[tokio::test]
async fn test_fragment_released_with_parent() {
    let manager = manager();
    let folders = QueryKey::from("folders");
    let all = QueryKey::from("todos");
    manager.hydrate::<Todo>(&[todo_json(6, "shared")], &all).unwrap();
    manager
        .hydrate::<Folder>(
            &[json!({
                "id": "f1",
                "name": "Inbox",
                "todos": [todo_json(5, "inside"), todo_json(6, "shared")]
            })],
            &folders,
        )
        .unwrap();

    let fragment = QueryKey::fragment("folder", "f1", "todos");
    assert_eq!(manager.query_entities::<Todo>(&fragment).unwrap().unwrap().len(), 2);
    assert_eq!(manager.ref_count::<Todo>(&6), 2);

    // Releasing the parent cascades into its fragment
    manager.release(&folders);
    assert!(manager.get::<Folder>(&"f1".to_string()).is_none());
    assert!(manager.get::<Todo>(&5).is_none());
    assert!(manager.get::<Todo>(&6).is_some());
    assert!(manager.query_entities::<Todo>(&fragment).unwrap().is_none());
}

#[tokio::test]
async fn test_list_keys_skip_single_and_fragment_keys() {
    let manager = manager();
    let list = QueryKey::from("todos");
    let single = QueryKey::from(["todo", "1"]);
    manager.hydrate::<Todo>(&[todo_json(1, "a")], &list).unwrap();
    manager.hydrate_one::<Todo>(&todo_json(1, "a"), &single).unwrap();
    manager
        .hydrate::<Folder>(&[json!({"id": "f1", "name": "Inbox", "todos": []})], &QueryKey::from("folders"))
        .unwrap();

    let lists = manager.list_keys_for_type("todo");
    assert_eq!(lists.len(), 1);
    assert!(lists.contains(&list));
    assert_eq!(manager.query_keys_for_type("todo").len(), 3);
}

#[tokio::test]
async fn test_revision_and_stats() {
    let manager = manager();
    let revision = manager.revision("todo");
    assert_eq!(revision.get(), 0);

    let key = QueryKey::from("todos");
    manager.hydrate::<Todo>(&[todo_json(1, "a"), todo_json(2, "b")], &key).unwrap();
    assert!(revision.get() > 0);

    let stats = manager.stats();
    assert_eq!(stats.entities, 2);
    assert_eq!(stats.query_keys, 1);
    assert_eq!(stats.per_type.get("todo"), Some(&2));
}

#[tokio::test]
async fn test_invalid_records_rejected() {
    let manager = manager();
    let key = QueryKey::from("todos");

    assert!(manager.hydrate::<Todo>(&[json!({"title": "no id"})], &key).is_err());
    assert!(manager.hydrate::<Todo>(&[json!("not a record")], &key).is_err());
    // Nothing was half-applied
    assert!(manager.is_empty());
}
