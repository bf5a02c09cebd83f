// ============================================================================
// Update Mutation
// ============================================================================
//
// mutate(entity, patch):
//   - snapshot, then apply the patch as local edits
//   - nothing dirty: resolve NoChanges without a network call
//   - otherwise send the dirty fields; on success they become the clean
//     snapshot and the response is merged, on failure the snapshot is
//     replayed (or the canonical value re-hydrated on a conflict)
//
// Entities keep only a weak manager handle through this binding, so an
// update declared on every entity does not keep the manager alive.
//
// ============================================================================

use super::context::{MutationContext, MutationFn, merge_response, undo};
use super::invalidation::InvalidationStrategy;
use super::machine::{MutationMachine, MutationPhase};
use super::record::MutationRecord;
use crate::core::{CacheError, JsonValue, Result};
use crate::entity::{Entity, EntityModel, EntitySave, SaveOutcome};
use crate::manager::{EntityManager, WeakEntityManager};
use crate::query::QueryCache;
use async_trait::async_trait;
use serde_json::Map;
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

struct UpdateInner<M: EntityModel> {
    manager: WeakEntityManager,
    context: MutationContext<M>,
}

/// Sends local edits of one entity at a time. Clones share one state
/// machine.
pub struct UpdateMutation<M: EntityModel> {
    inner: Arc<UpdateInner<M>>,
}

impl<M: EntityModel> Clone for UpdateMutation<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: EntityModel> fmt::Debug for UpdateMutation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateMutation")
            .field("entity_type", &M::ENTITY_TYPE)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<M: EntityModel> UpdateMutation<M> {
    pub fn new(
        manager: &EntityManager,
        cache: Arc<dyn QueryCache>,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Self {
        Self {
            inner: Arc::new(UpdateInner {
                manager: manager.downgrade(),
                context: MutationContext::new(manager.reactor(), cache, call, invalidation),
            }),
        }
    }

    /// Gives every entity of `M`, current and future, its own update
    /// mutation, so `Entity::save` works everywhere.
    pub fn declare_for_all(
        manager: &EntityManager,
        cache: Arc<dyn QueryCache>,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Result<()> {
        let weak = manager.downgrade();
        manager.declare_update::<M, _>(move || {
            let update: Arc<dyn EntitySave<M>> = Arc::new(UpdateMutation::<M>::from_weak(
                weak.clone(),
                Arc::clone(&cache),
                Arc::clone(&call),
                invalidation,
            ));
            update
        })
    }

    fn from_weak(
        manager: WeakEntityManager,
        cache: Arc<dyn QueryCache>,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Self {
        let reactor = manager
            .upgrade()
            .map(|manager| manager.reactor().clone())
            .unwrap_or_default();
        Self {
            inner: Arc::new(UpdateInner {
                context: MutationContext::new(&reactor, cache, call, invalidation),
                manager,
            }),
        }
    }

    /// Attaches this binding to `entity` as its save path.
    pub fn declare_on(&self, entity: &Entity<M>) {
        entity.declare_update(Arc::new(self.clone()));
    }

    pub fn phase(&self) -> MutationPhase {
        self.inner.context.machine.phase()
    }

    pub fn error(&self) -> Option<CacheError> {
        self.inner.context.machine.error()
    }

    pub fn machine(&self) -> &MutationMachine {
        &self.inner.context.machine
    }

    pub fn reset(&self) -> Result<()> {
        self.inner.context.machine.reset()
    }

    pub fn last_record(&self) -> Option<MutationRecord<M>> {
        self.inner.context.last_record()
    }

    fn manager(&self) -> Result<EntityManager> {
        self.inner
            .manager
            .upgrade()
            .ok_or_else(|| CacheError::Disposed("entity manager".to_string()))
    }

    /// Applies `patch` as local edits, then sends every dirty field.
    pub async fn mutate(&self, entity: &Entity<M>, patch: Map<String, JsonValue>) -> Result<SaveOutcome> {
        let context = &self.inner.context;
        let manager = self.manager()?;
        context.machine.ensure_ready()?;

        let patched: Vec<String> = patch.keys().cloned().collect();
        let mut record = MutationRecord::capture(std::slice::from_ref(entity), context.invalidation);
        if !patch.is_empty() {
            entity.set_many(patch)?;
        }
        if !entity.is_dirty() {
            event!(Level::DEBUG, entity = %entity.key(), "update skipped, nothing dirty");
            return Ok(SaveOutcome::NoChanges);
        }
        let submitted = entity.changes();
        let touched: Vec<&str> = patched
            .iter()
            .map(String::as_str)
            .chain(submitted.keys().map(String::as_str))
            .collect();
        record.retain_fields(&touched);
        let mut payload = submitted.clone();
        payload.insert(
            entity.schema().id_field_name().to_string(),
            serde_json::to_value(entity.id())?,
        );

        if let Err(err) = context.machine.begin() {
            record.restore();
            return Err(err);
        }

        let span = info_span!("update_mutation", entity = %entity.key());
        let hold = match manager.hold(entity) {
            Ok(hold) => Some(hold),
            Err(err) => {
                event!(Level::DEBUG, entity = %entity.key(), error = %err, "updating an entity the manager no longer holds");
                None
            }
        };

        let outcome = context
            .execute(JsonValue::Object(payload))
            .instrument(span.clone())
            .await;

        let result = match outcome {
            Ok(response) => {
                span.in_scope(|| {
                    let _batch = manager.reactor().begin_batch();
                    entity.commit_clean(&submitted);
                    merge_response(&manager, entity, &response);
                });
                context
                    .confirm(&manager, record, &[M::ENTITY_TYPE])
                    .instrument(span)
                    .await
                    .map(|_| SaveOutcome::Saved)
            }
            Err(err) => {
                span.in_scope(|| undo(&manager, &record, entity, err.canonical()));
                context.roll_back(record, &err);
                Err(err)
            }
        };
        drop(hold);
        result
    }
}

#[async_trait]
impl<M: EntityModel> EntitySave<M> for UpdateMutation<M> {
    async fn save_entity(&self, entity: &Entity<M>) -> Result<SaveOutcome> {
        self.mutate(entity, Map::new()).await
    }
}
