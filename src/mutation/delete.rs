use super::context::{MutationContext, MutationFn, undo};
use super::invalidation::InvalidationStrategy;
use super::machine::{MutationMachine, MutationPhase};
use super::record::MutationRecord;
use crate::core::{CacheError, JsonValue, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::EntityManager;
use crate::query::QueryCache;
use serde_json::Map;
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Tombstones an entity while the delete is pending; evicts it once the
/// server confirms, clears the tombstone if it does not.
pub struct DeleteMutation<M: EntityModel> {
    manager: EntityManager,
    context: MutationContext<M>,
}

impl<M: EntityModel> fmt::Debug for DeleteMutation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteMutation")
            .field("entity_type", &M::ENTITY_TYPE)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<M: EntityModel> DeleteMutation<M> {
    pub fn new(
        manager: &EntityManager,
        cache: Arc<dyn QueryCache>,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Self {
        Self {
            context: MutationContext::new(manager.reactor(), cache, call, invalidation),
            manager: manager.clone(),
        }
    }

    pub fn phase(&self) -> MutationPhase {
        self.context.machine.phase()
    }

    pub fn error(&self) -> Option<CacheError> {
        self.context.machine.error()
    }

    pub fn machine(&self) -> &MutationMachine {
        &self.context.machine
    }

    pub fn reset(&self) -> Result<()> {
        self.context.machine.reset()
    }

    pub fn last_record(&self) -> Option<MutationRecord<M>> {
        self.context.last_record()
    }

    pub async fn mutate(&self, entity: &Entity<M>) -> Result<()> {
        let mut payload = Map::new();
        payload.insert(
            entity.schema().id_field_name().to_string(),
            serde_json::to_value(entity.id())?,
        );

        self.context.machine.begin()?;
        let span = info_span!("delete_mutation", entity = %entity.key());
        // Only the tombstone flag changes
        let record = self.context.record::<&str>(std::slice::from_ref(entity), &[]);
        let hold = self.manager.hold(entity).ok();

        span.in_scope(|| {
            let _batch = self.manager.reactor().begin_batch();
            entity.set_removed(true);
            self.manager.bump_revision(M::ENTITY_TYPE);
            event!(Level::DEBUG, "delete pending");
        });

        let outcome = self
            .context
            .execute(JsonValue::Object(payload))
            .instrument(span.clone())
            .await;

        let result = match outcome {
            Ok(_) => {
                span.in_scope(|| {
                    if let Err(err) = self.manager.remove::<M>(&entity.id()) {
                        log::warn!("evicting deleted {} failed: {}", entity.key(), err);
                    }
                });
                self.context
                    .confirm(&self.manager, record, &[M::ENTITY_TYPE])
                    .instrument(span)
                    .await
                    .map(|_| ())
            }
            Err(err) => {
                span.in_scope(|| {
                    let _batch = self.manager.reactor().begin_batch();
                    undo(&self.manager, &record, entity, err.canonical());
                    self.manager.bump_revision(M::ENTITY_TYPE);
                });
                self.context.roll_back(record, &err);
                Err(err)
            }
        };
        drop(hold);
        result
    }
}
