use super::binding::{BindingCore, ParentCheck, QuerySubscription, Shape};
use super::cache::{QueryCache, QueryFetcher};
use super::options::QueryOptions;
use super::state::{QueryState, QueryStatus};
use crate::core::{CacheError, EntityKey, QueryKey, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::EntityManager;
use std::fmt;
use std::sync::Arc;

/// Named sub-result owned by a parent entity.
///
/// Seeded from the parent's hydration payload under the fragment name and
/// refreshable on its own. The fragment key is released together with the
/// parent, never by this handle.
pub struct QueryFragment<C: EntityModel> {
    core: Arc<BindingCore<C>>,
    parent: EntityKey,
    parent_alive: ParentCheck,
}

impl<C: EntityModel> Clone for QueryFragment<C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            parent: self.parent.clone(),
            parent_alive: Arc::clone(&self.parent_alive),
        }
    }
}

impl<C: EntityModel> fmt::Debug for QueryFragment<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFragment")
            .field("parent", &self.parent)
            .field("key", self.core.key())
            .field("status", &self.core.status())
            .finish()
    }
}

impl<C: EntityModel> QueryFragment<C> {
    /// Binds the fragment `name` declared on `P`'s schema.
    pub fn attach<P: EntityModel>(
        manager: &EntityManager,
        cache: Arc<dyn QueryCache>,
        parent: &Entity<P>,
        name: &str,
        fetcher: QueryFetcher,
    ) -> Result<Self> {
        let spec = parent
            .schema()
            .fragment_spec(name)
            .ok_or_else(|| CacheError::UnknownField {
                entity_type: P::ENTITY_TYPE.to_string(),
                field: name.to_string(),
            })?;
        if spec.child_type != C::ENTITY_TYPE {
            return Err(CacheError::TypeMismatch(format!(
                "fragment '{}' of '{}' holds '{}', not '{}'",
                name,
                P::ENTITY_TYPE,
                spec.child_type,
                C::ENTITY_TYPE
            )));
        }

        let key = QueryKey::fragment(P::ENTITY_TYPE, &parent.id().to_string(), name);
        let parent_alive: ParentCheck = {
            let manager = manager.clone();
            let parent = parent.clone();
            Arc::new(move || {
                !parent.is_removed()
                    && manager
                        .get::<P>(&parent.id())
                        .is_some_and(|live| live.ptr_eq(&parent))
            })
        };

        let options = QueryOptions::new(key, fetcher);
        Ok(Self {
            core: BindingCore::new(
                manager.clone(),
                cache,
                options,
                Shape::Fragment(Arc::clone(&parent_alive)),
            ),
            parent: parent.key(),
            parent_alive,
        })
    }

    pub fn key(&self) -> &QueryKey {
        self.core.key()
    }

    pub fn parent(&self) -> &EntityKey {
        &self.parent
    }

    pub fn is_parent_alive(&self) -> bool {
        (self.parent_alive)()
    }

    /// True once the parent payload (or a refresh) has filled the fragment.
    pub fn is_seeded(&self) -> bool {
        matches!(
            self.core.manager().query_entities::<C>(self.core.key()),
            Ok(Some(_))
        )
    }

    pub fn entities(&self) -> Vec<Entity<C>> {
        if !self.is_parent_alive() {
            return Vec::new();
        }
        self.core.entities()
    }

    pub fn state(&self) -> QueryState<Vec<Entity<C>>> {
        match self.core.state(|| self.entities()) {
            QueryState::Idle if self.is_seeded() => QueryState::Ready(self.entities()),
            state => state,
        }
    }

    pub fn status(&self) -> QueryStatus {
        self.core.status()
    }

    pub fn error(&self) -> Option<CacheError> {
        self.core.error()
    }

    pub async fn fetch(&self) -> Result<Vec<Entity<C>>> {
        self.ensure_parent()?;
        self.core.fetch().await?;
        Ok(self.entities())
    }

    /// Refreshes the fragment without refetching the parent.
    pub async fn refetch(&self) -> Result<Vec<Entity<C>>> {
        self.ensure_parent()?;
        self.core.refetch().await?;
        Ok(self.entities())
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> QuerySubscription {
        self.core.subscribe(callback)
    }

    fn ensure_parent(&self) -> Result<()> {
        if self.is_parent_alive() {
            Ok(())
        } else {
            Err(CacheError::EntityNotFound {
                entity_type: self.parent.entity_type.clone(),
                id: self.parent.id.clone(),
            })
        }
    }
}
