#![allow(dead_code)]

use entity_query::query::{InMemoryQueryCache, QueryCacheConfig};
use entity_query::{
    CacheError, EntityManager, EntityModel, EntitySchema, JsonValue, MutationFn, QueryFetcher,
    QueryKey, fetcher, mutation_fn,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
}

impl EntityModel for Todo {
    type Id = i64;
    const ENTITY_TYPE: &'static str = "todo";

    fn schema() -> EntitySchema {
        EntitySchema::new(Self::ENTITY_TYPE)
            .fields(["title", "completed"])
            .relation("tag_ids")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
}

impl EntityModel for Folder {
    type Id = String;
    const ENTITY_TYPE: &'static str = "folder";

    fn schema() -> EntitySchema {
        EntitySchema::new(Self::ENTITY_TYPE)
            .field("name")
            .fragment::<Todo>("todos")
    }
}

pub fn todo_json(id: i64, title: &str) -> JsonValue {
    json!({"id": id, "title": title, "completed": false, "tag_ids": []})
}

pub fn object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn manager() -> EntityManager {
    EntityManager::default()
}

pub fn cache() -> Arc<InMemoryQueryCache> {
    Arc::new(InMemoryQueryCache::new(QueryCacheConfig::new()).unwrap())
}

/// Scripted backend: serves payloads per key and records mutation calls.
#[derive(Default)]
pub struct FakeServer {
    payloads: Mutex<HashMap<QueryKey, JsonValue>>,
    fetches: AtomicUsize,
    calls: Mutex<Vec<JsonValue>>,
    fail_mutations: AtomicBool,
    conflict: Mutex<Option<Option<JsonValue>>>,
    responses: Mutex<Vec<JsonValue>>,
    mutation_gate: Mutex<Option<Arc<Notify>>>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, key: impl Into<QueryKey>, payload: JsonValue) {
        self.payloads.lock().unwrap().insert(key.into(), payload);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> Vec<JsonValue> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    /// Next mutation fails with a conflict carrying `canonical`.
    pub fn conflict_next(&self, canonical: Option<JsonValue>) {
        *self.conflict.lock().unwrap() = Some(canonical);
    }

    /// Queues the response of the next successful mutation (default: echo).
    pub fn respond_with(&self, response: JsonValue) {
        self.responses.lock().unwrap().push(response);
    }

    /// The next mutation call waits for the returned notify before answering.
    pub fn hold_next_mutation(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.mutation_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// The next fetch waits for the returned notify before answering.
    pub fn hold_next_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.fetch_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fetcher(self: &Arc<Self>) -> QueryFetcher {
        let server = Arc::clone(self);
        fetcher(move |key| {
            let server = Arc::clone(&server);
            async move {
                let gate = server.fetch_gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                server.fetches.fetch_add(1, Ordering::SeqCst);
                server
                    .payloads
                    .lock()
                    .unwrap()
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| CacheError::fetch(&key, "no payload scripted"))
            }
        })
    }

    pub fn mutation(self: &Arc<Self>) -> MutationFn {
        let server = Arc::clone(self);
        mutation_fn(move |payload| {
            let server = Arc::clone(&server);
            async move {
                let gate = server.mutation_gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                server.calls.lock().unwrap().push(payload.clone());
                if let Some(canonical) = server.conflict.lock().unwrap().take() {
                    return Err(CacheError::conflict("todo", "stale write", canonical));
                }
                if server.fail_mutations.load(Ordering::SeqCst) {
                    return Err(CacheError::mutation("todo", "rejected by server"));
                }
                let queued = {
                    let mut responses = server.responses.lock().unwrap();
                    if responses.is_empty() {
                        None
                    } else {
                        Some(responses.remove(0))
                    }
                };
                Ok(queued.unwrap_or(payload))
            }
        })
    }
}
