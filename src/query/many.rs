use super::binding::{BindingCore, QuerySubscription, Shape};
use super::cache::QueryCache;
use super::options::QueryOptions;
use super::state::{QueryState, QueryStatus};
use crate::core::{CacheError, QueryKey, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::EntityManager;
use std::fmt;
use std::sync::Arc;

/// Ordered list of shared entities behind one query key.
///
/// Server order is kept, duplicates included. Clones share the binding;
/// the last clone dropped disposes it.
pub struct QueryMany<M: EntityModel> {
    core: Arc<BindingCore<M>>,
}

impl<M: EntityModel> Clone for QueryMany<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<M: EntityModel> fmt::Debug for QueryMany<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryMany")
            .field("entity_type", &M::ENTITY_TYPE)
            .field("key", self.core.key())
            .field("status", &self.core.status())
            .finish()
    }
}

impl<M: EntityModel> QueryMany<M> {
    pub fn new(manager: &EntityManager, cache: Arc<dyn QueryCache>, options: QueryOptions) -> Self {
        Self {
            core: BindingCore::new(manager.clone(), cache, options, Shape::Many),
        }
    }

    pub fn key(&self) -> &QueryKey {
        self.core.key()
    }

    pub fn manager(&self) -> &EntityManager {
        self.core.manager()
    }

    /// Current list; empty until the first fetch lands.
    pub fn entities(&self) -> Vec<Entity<M>> {
        self.core.entities()
    }

    pub fn len(&self) -> usize {
        self.entities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities().is_empty()
    }

    pub fn state(&self) -> QueryState<Vec<Entity<M>>> {
        self.core.state(|| self.core.entities())
    }

    pub fn status(&self) -> QueryStatus {
        self.core.status()
    }

    pub fn error(&self) -> Option<CacheError> {
        self.core.error()
    }

    pub fn is_fetching(&self) -> bool {
        self.core.is_fetching()
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Fetches through the cache (served from it while fresh) and hydrates.
    pub async fn fetch(&self) -> Result<Vec<Entity<M>>> {
        self.core.fetch().await?;
        Ok(self.entities())
    }

    /// Forces a refetch of the key.
    pub async fn refetch(&self) -> Result<Vec<Entity<M>>> {
        self.core.refetch().await?;
        Ok(self.entities())
    }

    /// Releases the key. A fetch still in flight finishes first.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> QuerySubscription {
        self.core.subscribe(callback)
    }
}
