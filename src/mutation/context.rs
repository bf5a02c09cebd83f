use super::invalidation::InvalidationStrategy;
use super::machine::{MutationMachine, MutationPhase};
use super::record::MutationRecord;
use crate::core::{CacheError, JsonValue, QueryKey, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::EntityManager;
use crate::observable::Reactor;
use crate::query::{QueryCache, mutation_call};
use futures::future::BoxFuture;
use serde_json::Map;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Level, event};

/// The network side of a mutation: receives the request payload, resolves
/// to the server response.
pub type MutationFn = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

pub fn mutation_fn<F, Fut>(call: F) -> MutationFn
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(call(payload)))
}

/// State every mutation binding carries.
pub(crate) struct MutationContext<M: EntityModel> {
    pub cache: Arc<dyn QueryCache>,
    pub call: MutationFn,
    pub invalidation: InvalidationStrategy,
    pub machine: MutationMachine,
    last: Mutex<Option<MutationRecord<M>>>,
}

impl<M: EntityModel> MutationContext<M> {
    pub fn new(
        reactor: &Reactor,
        cache: Arc<dyn QueryCache>,
        call: MutationFn,
        invalidation: InvalidationStrategy,
    ) -> Self {
        Self {
            machine: MutationMachine::new(reactor),
            last: Mutex::new(None),
            cache,
            call,
            invalidation,
        }
    }

    /// Runs the call through the cache; any terminal failure comes back as
    /// a mutation error.
    pub async fn execute(&self, payload: JsonValue) -> Result<JsonValue> {
        let call = Arc::clone(&self.call);
        self.cache
            .execute_mutation(mutation_call(move || call(payload.clone())))
            .await
            .map_err(|err| err.into_mutation_failure(M::ENTITY_TYPE))
    }

    /// Snapshots `targets`, keeping only the `fields` the mutation writes.
    pub fn record<S: AsRef<str>>(&self, targets: &[Entity<M>], fields: &[S]) -> MutationRecord<M> {
        let mut record = MutationRecord::capture(targets, self.invalidation);
        record.retain_fields(fields);
        record
    }

    /// Pending -> Confirmed, then invalidation.
    pub async fn confirm(
        &self,
        manager: &EntityManager,
        mut record: MutationRecord<M>,
        entity_types: &[&str],
    ) -> Result<Vec<QueryKey>> {
        self.machine.confirm()?;
        record.finish(MutationPhase::Confirmed);
        event!(Level::DEBUG, entity_type = M::ENTITY_TYPE, targets = ?record.keys(), "mutation confirmed");
        self.store(record);
        Ok(self
            .invalidation
            .apply(manager, self.cache.as_ref(), entity_types)
            .await)
    }

    /// Pending -> RolledBack, after the caller undid the optimistic state.
    pub fn roll_back(&self, mut record: MutationRecord<M>, error: &CacheError) {
        if let Err(err) = self.machine.roll_back(error.clone()) {
            log::warn!("mutation on '{}' could not roll back: {}", M::ENTITY_TYPE, err);
        }
        record.finish(MutationPhase::RolledBack);
        event!(Level::DEBUG, entity_type = M::ENTITY_TYPE, targets = ?record.keys(), error = %error, "mutation rolled back");
        self.store(record);
    }

    fn store(&self, record: MutationRecord<M>) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
    }

    pub fn last_record(&self) -> Option<MutationRecord<M>> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// `record` as a raw record of `entity`, its id filled in when missing.
fn with_id<M: EntityModel>(entity: &Entity<M>, record: &Map<String, JsonValue>) -> Result<JsonValue> {
    let mut record = record.clone();
    let id_field = entity.schema().id_field_name();
    if !record.contains_key(id_field) {
        record.insert(id_field.to_string(), serde_json::to_value(entity.id())?);
    }
    Ok(JsonValue::Object(record))
}

/// Undoes the optimistic state of `record`: a conflict carrying a canonical
/// value re-hydrates from it, anything else replays the snapshots.
pub(crate) fn undo<M: EntityModel>(
    manager: &EntityManager,
    record: &MutationRecord<M>,
    entity: &Entity<M>,
    canonical: Option<&JsonValue>,
) {
    let _batch = manager.reactor().begin_batch();
    record.restore();

    let Some(JsonValue::Object(canonical)) = canonical else {
        return;
    };
    let merged = with_id(entity, canonical)
        .and_then(|canonical| manager.merge_server_record::<M>(&canonical, true));
    if let Err(err) = merged {
        log::warn!("re-hydrating {} from canonical value failed: {}", entity.key(), err);
    }
}

/// Merges a confirmed response into its entity when it is a record.
pub(crate) fn merge_response<M: EntityModel>(
    manager: &EntityManager,
    entity: &Entity<M>,
    response: &JsonValue,
) {
    let JsonValue::Object(fields) = response else {
        return;
    };
    let merged = with_id(entity, fields)
        .and_then(|record| manager.merge_server_record::<M>(&record, false));
    if let Err(err) = merged {
        log::warn!("merging server response into {} failed: {}", entity.key(), err);
    }
}
