use super::binding::{BindingCore, QuerySubscription, Shape};
use super::cache::QueryCache;
use super::options::QueryOptions;
use super::state::{QueryState, QueryStatus};
use crate::core::{CacheError, QueryKey, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::EntityManager;
use std::fmt;
use std::sync::Arc;

/// Single shared entity behind one query key. A null payload reads as
/// `None`.
pub struct QueryOne<M: EntityModel> {
    core: Arc<BindingCore<M>>,
}

impl<M: EntityModel> Clone for QueryOne<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<M: EntityModel> fmt::Debug for QueryOne<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOne")
            .field("entity_type", &M::ENTITY_TYPE)
            .field("key", self.core.key())
            .field("status", &self.core.status())
            .finish()
    }
}

impl<M: EntityModel> QueryOne<M> {
    pub fn new(manager: &EntityManager, cache: Arc<dyn QueryCache>, options: QueryOptions) -> Self {
        Self {
            core: BindingCore::new(manager.clone(), cache, options, Shape::One),
        }
    }

    pub fn key(&self) -> &QueryKey {
        self.core.key()
    }

    pub fn entity(&self) -> Option<Entity<M>> {
        self.core.entities().into_iter().next()
    }

    pub fn state(&self) -> QueryState<Option<Entity<M>>> {
        self.core.state(|| self.entity())
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

    pub async fn fetch(&self) -> Result<Option<Entity<M>>> {
        self.core.fetch().await?;
        Ok(self.entity())
    }

    pub async fn refetch(&self) -> Result<Option<Entity<M>>> {
        self.core.refetch().await?;
        Ok(self.entity())
    }

    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> QuerySubscription {
        self.core.subscribe(callback)
    }
}
