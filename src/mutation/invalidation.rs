use crate::core::QueryKey;
use crate::manager::EntityManager;
use crate::query::{InvalidateFilter, QueryCache};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{Level, event};

/// What a confirmed mutation marks stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationStrategy {
    /// Nothing; the caller refreshes by hand.
    None,
    /// Keys associated with the touched entity types.
    #[default]
    Related,
    /// Every active key.
    All,
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationStrategy::None => write!(f, "none"),
            InvalidationStrategy::Related => write!(f, "related"),
            InvalidationStrategy::All => write!(f, "all"),
        }
    }
}

impl InvalidationStrategy {
    /// Keys recorded for `entity_types`, by the cache's observers or by
    /// hydrations into the manager. Fragment keys are left to their parents.
    pub fn related_keys(
        manager: &EntityManager,
        cache: &dyn QueryCache,
        entity_types: &[&str],
    ) -> BTreeSet<QueryKey> {
        entity_types
            .iter()
            .flat_map(|entity_type| {
                let mut keys = cache.active_keys_for_entity_type(entity_type);
                keys.extend(manager.query_keys_for_type(entity_type));
                keys
            })
            .filter(|key| !key.is_fragment())
            .collect()
    }

    /// Runs the strategy; returns the keys the cache marked stale.
    pub async fn apply(
        &self,
        manager: &EntityManager,
        cache: &dyn QueryCache,
        entity_types: &[&str],
    ) -> Vec<QueryKey> {
        let filter = match self {
            InvalidationStrategy::None => return Vec::new(),
            InvalidationStrategy::All => InvalidateFilter::All,
            InvalidationStrategy::Related => {
                InvalidateFilter::Keys(Self::related_keys(manager, cache, entity_types))
            }
        };
        if filter.is_empty() {
            return Vec::new();
        }

        let invalidated = cache.invalidate(filter).await;
        event!(
            Level::DEBUG,
            strategy = %self,
            keys = invalidated.len(),
            "invalidated after mutation"
        );
        invalidated
    }
}
