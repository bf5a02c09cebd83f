use super::context::{MutationContext, MutationFn, merge_response, undo};
use super::invalidation::InvalidationStrategy;
use super::machine::{MutationMachine, MutationPhase};
use super::record::MutationRecord;
use crate::core::{CacheError, JsonValue, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::EntityManager;
use crate::query::QueryCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationOp {
    Add,
    Remove,
}

impl fmt::Display for RelationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationOp::Add => write!(f, "add"),
            RelationOp::Remove => write!(f, "remove"),
        }
    }
}

/// Request payload of a relation mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationChange {
    pub id: JsonValue,
    pub field: String,
    pub op: RelationOp,
    pub related: JsonValue,
}

/// Adds or removes ids on one relation field (an ordered id set).
///
/// Edge changes count as server state: they are written to both the
/// current and the clean value, so they never show up as unsaved edits.
pub struct RelationMutation<M: EntityModel> {
    manager: EntityManager,
    context: MutationContext<M>,
    field: String,
    related_types: Vec<&'static str>,
}

impl<M: EntityModel> fmt::Debug for RelationMutation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationMutation")
            .field("entity_type", &M::ENTITY_TYPE)
            .field("field", &self.field)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<M: EntityModel> RelationMutation<M> {
    /// Fails with `UnknownField` unless `field` is a declared relation.
    pub fn new(
        manager: &EntityManager,
        cache: Arc<dyn QueryCache>,
        field: &str,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Result<Self> {
        if !M::schema().is_relation(field) {
            return Err(CacheError::UnknownField {
                entity_type: M::ENTITY_TYPE.to_string(),
                field: field.to_string(),
            });
        }
        Ok(Self {
            context: MutationContext::new(manager.reactor(), cache, call, invalidation),
            manager: manager.clone(),
            field: field.to_string(),
            related_types: Vec::new(),
        })
    }

    /// Also invalidates queries of the related entity type on success.
    pub fn related<R: EntityModel>(mut self) -> Self {
        if R::ENTITY_TYPE != M::ENTITY_TYPE && !self.related_types.contains(&R::ENTITY_TYPE) {
            self.related_types.push(R::ENTITY_TYPE);
        }
        self
    }

    pub fn field(&self) -> &str {
        &self.field
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

    pub async fn add(&self, entity: &Entity<M>, related: impl Serialize) -> Result<()> {
        self.mutate(entity, RelationOp::Add, serde_json::to_value(related)?)
            .await
    }

    pub async fn remove(&self, entity: &Entity<M>, related: impl Serialize) -> Result<()> {
        self.mutate(entity, RelationOp::Remove, serde_json::to_value(related)?)
            .await
    }

    /// Current ids of the relation field on `entity`.
    pub fn ids(&self, entity: &Entity<M>) -> Vec<JsonValue> {
        match entity.get(&self.field) {
            Some(JsonValue::Array(ids)) => ids,
            _ => Vec::new(),
        }
    }

    async fn mutate(&self, entity: &Entity<M>, op: RelationOp, related: JsonValue) -> Result<()> {
        let payload = serde_json::to_value(RelationChange {
            id: serde_json::to_value(entity.id())?,
            field: self.field.clone(),
            op,
            related: related.clone(),
        })?;

        self.context.machine.begin()?;
        let span = info_span!(
            "relation_mutation",
            entity = %entity.key(),
            field = %self.field,
            op = %op
        );
        let record = self
            .context
            .record(std::slice::from_ref(entity), std::slice::from_ref(&self.field));
        let hold = self.manager.hold(entity).ok();

        let mut ids = self.ids(entity);
        match op {
            RelationOp::Add => {
                if !ids.contains(&related) {
                    ids.push(related);
                }
            }
            RelationOp::Remove => ids.retain(|id| id != &related),
        }
        if let Err(err) = entity.write_confirmed(&self.field, JsonValue::Array(ids)) {
            record.restore();
            self.context.roll_back(record, &err);
            return Err(err);
        }
        span.in_scope(|| event!(Level::DEBUG, "relation change pending"));

        let outcome = self
            .context
            .execute(payload)
            .instrument(span.clone())
            .await;

        let result = match outcome {
            Ok(response) => {
                span.in_scope(|| merge_response(&self.manager, entity, &response));
                let mut touched = vec![M::ENTITY_TYPE];
                touched.extend(self.related_types.iter().copied());
                self.context
                    .confirm(&self.manager, record, &touched)
                    .instrument(span)
                    .await
                    .map(|_| ())
            }
            Err(err) => {
                span.in_scope(|| undo(&self.manager, &record, entity, err.canonical()));
                self.context.roll_back(record, &err);
                Err(err)
            }
        };
        drop(hold);
        result
    }
}
