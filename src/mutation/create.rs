// ============================================================================
// Create Mutation
// ============================================================================
//
// mutate(input):
//   1. synthesize the record, with a provisional id unless one is given;
//      a given id that is already live is rejected before anything changes
//   2. insert it under a mutation hold and attach it to the target lists
//   3. send it; on success adopt the server id and merge the response,
//      on failure evict the provisional entity (stripping it from every list)
//
// ============================================================================

use super::context::{MutationContext, MutationFn};
use super::invalidation::InvalidationStrategy;
use super::machine::{MutationMachine, MutationPhase};
use super::record::MutationRecord;
use crate::core::{CacheError, JsonValue, QueryKey, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::{EntityHold, EntityManager, InsertPosition};
use crate::query::QueryCache;
use serde_json::Map;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Lists a freshly created entity is attached to while pending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttachTarget {
    /// Every list currently recorded for the entity type.
    #[default]
    AllListsOfType,
    /// Only these keys.
    Keys(BTreeSet<QueryKey>),
    /// Not attached to any list.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateOptions {
    pub attach: AttachTarget,
    pub position: InsertPosition,
    pub invalidation: InvalidationStrategy,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set attach target
    pub fn attach(mut self, attach: AttachTarget) -> Self {
        self.attach = attach;
        self
    }

    /// Set insert position
    pub fn position(mut self, position: InsertPosition) -> Self {
        self.position = position;
        self
    }

    /// Set invalidation strategy
    pub fn invalidation(mut self, invalidation: InvalidationStrategy) -> Self {
        self.invalidation = invalidation;
        self
    }
}

pub struct CreateMutation<M: EntityModel> {
    manager: EntityManager,
    context: MutationContext<M>,
    options: CreateOptions,
    id_field: String,
}

impl<M: EntityModel> fmt::Debug for CreateMutation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateMutation")
            .field("entity_type", &M::ENTITY_TYPE)
            .field("phase", &self.phase())
            .field("options", &self.options)
            .finish()
    }
}

impl<M: EntityModel> CreateMutation<M> {
    pub fn new(
        manager: &EntityManager,
        cache: Arc<dyn QueryCache>,
        call: MutationFn,
        options: CreateOptions,
    ) -> Self {
        Self {
            context: MutationContext::new(manager.reactor(), cache, call, options.invalidation),
            manager: manager.clone(),
            id_field: M::schema().id_field_name().to_string(),
            options,
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

    /// Inserts the entity optimistically and sends it. Resolves to the
    /// confirmed entity (re-keyed to the server id when one came back).
    pub async fn mutate(&self, input: Map<String, JsonValue>) -> Result<Entity<M>> {
        self.ensure_not_live(&input)?;
        self.context.machine.begin()?;
        let span = info_span!("create_mutation", entity_type = M::ENTITY_TYPE);

        let (entity, hold, payload) = match span.in_scope(|| self.apply_optimistic(input)) {
            Ok(applied) => applied,
            Err(err) => {
                if let Err(transition) = self.context.machine.roll_back(err.clone()) {
                    log::warn!("create on '{}' could not roll back: {}", M::ENTITY_TYPE, transition);
                }
                return Err(err);
            }
        };
        let fields: Vec<&str> = entity.schema().field_names().collect();
        let record = self.context.record(std::slice::from_ref(&entity), &fields);

        let outcome = self
            .context
            .execute(payload)
            .instrument(span.clone())
            .await;

        match outcome {
            Ok(response) => {
                let entity = span.in_scope(|| self.adopt_response(entity, &response));
                let invalidated = self
                    .context
                    .confirm(&self.manager, record, &[M::ENTITY_TYPE])
                    .instrument(span)
                    .await;
                drop(hold);
                invalidated?;
                Ok(entity)
            }
            Err(err) => {
                span.in_scope(|| {
                    if let Err(remove) = self.manager.remove::<M>(&entity.id()) {
                        log::warn!("evicting provisional {} failed: {}", entity.key(), remove);
                    }
                });
                drop(hold);
                self.context.roll_back(record, &err);
                Err(err)
            }
        }
    }

    /// A create owns the entity it inserts; one already in the identity map
    /// belongs to the server and is never written or evicted here.
    fn ensure_not_live(&self, input: &Map<String, JsonValue>) -> Result<()> {
        let Some(raw) = input.get(&self.id_field).filter(|raw| !raw.is_null()) else {
            return Ok(());
        };
        let id = serde_json::from_value::<M::Id>(raw.clone())
            .map_err(|err| CacheError::invalid_payload(M::ENTITY_TYPE, err))?;
        if self.manager.get::<M>(&id).is_some() {
            return Err(CacheError::EntityExists {
                entity_type: M::ENTITY_TYPE.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn apply_optimistic(
        &self,
        mut input: Map<String, JsonValue>,
    ) -> Result<(Entity<M>, EntityHold, JsonValue)> {
        // Provisional ids stay local; the server only sees the fields.
        let provisional = input.get(&self.id_field).is_none_or(JsonValue::is_null);
        if provisional {
            input.remove(&self.id_field);
        }
        let payload = JsonValue::Object(input.clone());
        if provisional {
            let id = self.manager.next_provisional_id::<M>();
            input.insert(self.id_field.clone(), serde_json::to_value(id)?);
        }

        let _batch = self.manager.reactor().begin_batch();
        let (entity, hold) = self.manager.insert_held::<M>(&JsonValue::Object(input))?;
        entity.set_provisional(provisional);

        for key in self.attach_keys() {
            if let Err(err) = self.manager.attach(&key, &entity, self.options.position) {
                log::warn!("attaching {} to {} failed: {}", entity.key(), key, err);
            }
        }
        event!(Level::DEBUG, entity = %entity.key(), provisional, "create pending");
        Ok((entity, hold, payload))
    }

    fn attach_keys(&self) -> BTreeSet<QueryKey> {
        match &self.options.attach {
            AttachTarget::AllListsOfType => self.manager.list_keys_for_type(M::ENTITY_TYPE),
            AttachTarget::Keys(keys) => keys.clone(),
            AttachTarget::None => BTreeSet::new(),
        }
    }

    /// Moves the entity to the id the server assigned and merges the
    /// returned record.
    fn adopt_response(&self, entity: Entity<M>, response: &JsonValue) -> Entity<M> {
        let _batch = self.manager.reactor().begin_batch();
        let mut entity = entity;

        if let Some(raw) = response.get(&self.id_field) {
            match serde_json::from_value::<M::Id>(raw.clone()) {
                Ok(server_id) if server_id != entity.id() => {
                    match self.manager.rekey::<M>(&entity.id(), &server_id) {
                        Ok(live) => entity = live,
                        Err(err) => log::warn!("re-keying {} failed: {}", entity.key(), err),
                    }
                }
                Ok(_) => {}
                Err(err) => log::warn!("server id {} for '{}' ignored: {}", raw, M::ENTITY_TYPE, err),
            }
        }

        super::context::merge_response(&self.manager, &entity, response);
        entity.set_provisional(false);
        entity
    }
}
