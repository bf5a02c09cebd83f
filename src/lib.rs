// ============================================================================
// entity-query Library
// ============================================================================

pub mod core;
pub mod entity;
pub mod manager;
pub mod mutation;
pub mod observable;
pub mod prelude;
pub mod query;

// Re-export main types for convenience
pub use crate::core::{CacheError, EntityKey, JsonValue, QueryKey, Result};
pub use entity::{Entity, EntityId, EntityModel, EntitySave, EntitySchema, SaveOutcome};
pub use manager::{EntityHold, EntityManager, EntityManagerConfig, EvictionPolicy, InsertPosition};
pub use observable::{ObservableCell, Reactor, Subscription};

// Re-export binding API
pub use mutation::{
    AttachTarget, CreateMutation, CreateOptions, DeleteMutation, InvalidationStrategy, MutationFn,
    MutationPhase, RelationMutation, UpdateMutation, mutation_fn,
};
pub use query::{
    InMemoryQueryCache, InvalidateFilter, QueryCache, QueryCacheConfig, QueryFetcher,
    QueryFragment, QueryMany, QueryOne, QueryOptions, QueryState, QueryStatus, fetcher,
};

use std::sync::Arc;

// ============================================================================
// High-level Store API
// ============================================================================

/// Entity manager plus query cache, wired once at start-up.
///
/// This is the recommended way to build bindings in application code:
/// every binding it hands out shares the same identity map and cache.
///
/// ```
/// use entity_query::{EntityModel, EntitySchema, EntityStore, QueryOptions};
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
///
/// #[derive(Serialize, Deserialize)]
/// struct Todo {
///     id: i64,
///     title: String,
/// }
///
/// impl EntityModel for Todo {
///     type Id = i64;
///     const ENTITY_TYPE: &'static str = "todo";
///
///     fn schema() -> EntitySchema {
///         EntitySchema::new(Self::ENTITY_TYPE).field("title")
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let store = EntityStore::in_memory().unwrap();
/// let todos = store.query_many::<Todo>(QueryOptions::from_fn("todos", |_key| async {
///     Ok(json!([{"id": 1, "title": "milk"}]))
/// }));
/// todos.fetch().await.unwrap();
/// assert_eq!(todos.entities()[0].get("title"), Some(json!("milk")));
/// # });
/// ```
#[derive(Clone)]
pub struct EntityStore {
    manager: EntityManager,
    cache: Arc<dyn QueryCache>,
}

impl EntityStore {
    pub fn new(manager: EntityManager, cache: Arc<dyn QueryCache>) -> Self {
        Self { manager, cache }
    }

    /// Store backed by the bundled in-memory cache with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::with_config(EntityManagerConfig::default(), QueryCacheConfig::default())
    }

    pub fn with_config(manager: EntityManagerConfig, cache: QueryCacheConfig) -> Result<Self> {
        Ok(Self {
            manager: EntityManager::new(manager)?,
            cache: Arc::new(InMemoryQueryCache::new(cache)?),
        })
    }

    pub fn manager(&self) -> &EntityManager {
        &self.manager
    }

    pub fn cache(&self) -> Arc<dyn QueryCache> {
        Arc::clone(&self.cache)
    }

    pub fn query_one<M: EntityModel>(&self, options: QueryOptions) -> QueryOne<M> {
        QueryOne::new(&self.manager, self.cache(), options)
    }

    pub fn query_many<M: EntityModel>(&self, options: QueryOptions) -> QueryMany<M> {
        QueryMany::new(&self.manager, self.cache(), options)
    }

    pub fn fragment<C: EntityModel, P: EntityModel>(
        &self,
        parent: &Entity<P>,
        name: &str,
        fetcher: QueryFetcher,
    ) -> Result<QueryFragment<C>> {
        QueryFragment::attach(&self.manager, self.cache(), parent, name, fetcher)
    }

    pub fn create<M: EntityModel>(&self, call: MutationFn, options: CreateOptions) -> CreateMutation<M> {
        CreateMutation::new(&self.manager, self.cache(), call, options)
    }

    pub fn update<M: EntityModel>(
        &self,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> UpdateMutation<M> {
        UpdateMutation::new(&self.manager, self.cache(), call, invalidation)
    }

    /// Declares `call` as the save path of every entity of `M`.
    pub fn declare_update<M: EntityModel>(
        &self,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Result<()> {
        UpdateMutation::<M>::declare_for_all(&self.manager, self.cache(), call, invalidation)
    }

    pub fn delete<M: EntityModel>(
        &self,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> DeleteMutation<M> {
        DeleteMutation::new(&self.manager, self.cache(), call, invalidation)
    }

    pub fn relation<M: EntityModel>(
        &self,
        field: &str,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Result<RelationMutation<M>> {
        RelationMutation::new(&self.manager, self.cache(), field, call, invalidation)
    }

    /// Marks matching queries stale; observed ones refetch and re-hydrate.
    pub async fn invalidate(&self, filter: InvalidateFilter) -> Vec<QueryKey> {
        self.cache.invalidate(filter).await
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("manager", &self.manager)
            .field("active_keys", &self.cache.active_keys().len())
            .finish()
    }
}
