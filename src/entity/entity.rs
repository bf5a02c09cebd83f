// ============================================================================
// Entity: canonical observable record with snapshot-based dirty tracking
// ============================================================================
//
// Each registered field has a current value (an observable cell) and a clean
// value (the last state known to match the server). A field is dirty while
// the two differ structurally.
//
// Hydration merge policy: an incoming server value always replaces the clean
// value. It replaces the current value only when the field is not dirty, so
// a refetch never clobbers an unsaved local edit.
//
// ============================================================================

use super::model::{EntityModel, EntitySchema};
use super::snapshot::EntitySnapshot;
use crate::core::{CacheError, EntityKey, JsonValue, Result};
use crate::observable::{Callback, ObservableCell, ObserverList, Reactor, Subscription};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Result of [`Entity::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing was dirty; no mutation was invoked.
    NoChanges,
    /// The update mutation confirmed the changes.
    Saved,
}

/// Update path an entity delegates `save()` to.
#[async_trait]
pub trait EntitySave<M: EntityModel>: Send + Sync {
    async fn save_entity(&self, entity: &Entity<M>) -> Result<SaveOutcome>;
}

pub(crate) struct EntityInner<M: EntityModel> {
    schema: Arc<EntitySchema>,
    reactor: Reactor,
    id: ObservableCell<M::Id>,
    fields: BTreeMap<String, ObservableCell<JsonValue>>,
    clean: Mutex<BTreeMap<String, JsonValue>>,
    dirty: ObservableCell<bool>,
    removed: ObservableCell<bool>,
    provisional: ObservableCell<bool>,
    hydrated_at: AtomicU64,
    observers: ObserverList,
    update: RwLock<Option<Arc<dyn EntitySave<M>>>>,
}

/// Shared handle to the single live instance of `(M::ENTITY_TYPE, id)`.
pub struct Entity<M: EntityModel> {
    inner: Arc<EntityInner<M>>,
}

impl<M: EntityModel> Clone for Entity<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: EntityModel> fmt::Debug for Entity<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &M::ENTITY_TYPE)
            .field("id", &self.id())
            .field("dirty", &self.is_dirty())
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl<M: EntityModel> Entity<M> {
    pub(crate) fn new(schema: Arc<EntitySchema>, reactor: &Reactor, id: M::Id) -> Self {
        let fields = schema
            .field_names()
            .map(|name| (name.to_string(), ObservableCell::new(reactor, JsonValue::Null)))
            .collect();
        let clean = schema
            .field_names()
            .map(|name| (name.to_string(), JsonValue::Null))
            .collect();

        Self {
            inner: Arc::new(EntityInner {
                id: ObservableCell::new(reactor, id),
                fields,
                clean: Mutex::new(clean),
                dirty: ObservableCell::new(reactor, false),
                removed: ObservableCell::new(reactor, false),
                provisional: ObservableCell::new(reactor, false),
                hydrated_at: AtomicU64::new(0),
                observers: ObserverList::default(),
                update: RwLock::new(None),
                reactor: reactor.clone(),
                schema,
            }),
        }
    }

    pub fn id(&self) -> M::Id {
        self.inner.id.get()
    }

    pub fn entity_type(&self) -> &'static str {
        M::ENTITY_TYPE
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(M::ENTITY_TYPE, self.id())
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.inner.schema
    }

    /// True when both handles point at the same live instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, field: &str) -> Option<JsonValue> {
        self.inner.fields.get(field).map(ObservableCell::get)
    }

    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Result<T> {
        let value = self.cell(field)?.get();
        Ok(serde_json::from_value(value)?)
    }

    /// Last value known to match the server.
    pub fn clean_value(&self, field: &str) -> Option<JsonValue> {
        self.inner
            .clean
            .lock()
            .ok()
            .and_then(|clean| clean.get(field).cloned())
    }

    /// Current values deserialized into the model.
    pub fn data(&self) -> Result<M> {
        Ok(serde_json::from_value(self.to_record()?)?)
    }

    /// Current values plus the id, as a raw record.
    pub fn to_record(&self) -> Result<JsonValue> {
        let mut object: Map<String, JsonValue> = self
            .inner
            .fields
            .iter()
            .map(|(name, cell)| (name.clone(), cell.get()))
            .collect();
        object.insert(
            self.inner.schema.id_field_name().to_string(),
            serde_json::to_value(self.id())?,
        );
        Ok(JsonValue::Object(object))
    }

    /// Clean values deserialized into the model.
    pub fn clean_data(&self) -> Result<M> {
        let clean = self.inner.clean.lock()?.clone();
        self.decode(clean)
    }

    fn decode(&self, values: BTreeMap<String, JsonValue>) -> Result<M> {
        let mut object: Map<String, JsonValue> = values.into_iter().collect();
        object.insert(
            self.inner.schema.id_field_name().to_string(),
            serde_json::to_value(self.id())?,
        );
        Ok(serde_json::from_value(JsonValue::Object(object))?)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Writes the current value of `field`. The clean snapshot is untouched.
    pub fn set<T: Serialize>(&self, field: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let cell = self.cell(field)?;
        let _batch = self.inner.reactor.begin_batch();
        if cell.set(value) {
            self.notify_observers();
        }
        self.refresh_dirty();
        Ok(())
    }

    /// Writes several fields as one batch. Unknown fields reject the whole call.
    pub fn set_many(&self, values: Map<String, JsonValue>) -> Result<()> {
        for name in values.keys() {
            self.cell(name)?;
        }

        let _batch = self.inner.reactor.begin_batch();
        let mut changed = false;
        for (name, value) in values {
            if let Some(cell) = self.inner.fields.get(&name) {
                changed |= cell.set(value);
            }
        }
        if changed {
            self.notify_observers();
        }
        self.refresh_dirty();
        Ok(())
    }

    /// Writes every registered field from `data` as one batch.
    pub fn set_data(&self, data: &M) -> Result<()> {
        let JsonValue::Object(mut object) = serde_json::to_value(data)? else {
            return Err(CacheError::invalid_payload(
                M::ENTITY_TYPE,
                "model did not serialize to an object",
            ));
        };
        let values = self
            .inner
            .schema
            .field_names()
            .filter_map(|name| object.remove(name).map(|value| (name.to_string(), value)))
            .collect();
        self.set_many(values)
    }

    /// Restores every field to its clean value. No network call.
    pub fn reset(&self) {
        let _batch = self.inner.reactor.begin_batch();
        let mut changed = false;
        if let Ok(clean) = self.inner.clean.lock() {
            for (name, cell) in &self.inner.fields {
                if let Some(value) = clean.get(name) {
                    changed |= cell.set(value.clone());
                }
            }
        }
        if changed {
            self.notify_observers();
        }
        self.refresh_dirty();
    }

    // ------------------------------------------------------------------
    // Dirty tracking
    // ------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    pub fn is_field_dirty(&self, field: &str) -> bool {
        let Some(cell) = self.inner.fields.get(field) else {
            return false;
        };
        let Ok(clean) = self.inner.clean.lock() else {
            return false;
        };
        cell.with(|current| clean.get(field) != Some(current))
    }

    pub fn dirty_fields(&self) -> Vec<String> {
        self.changes().keys().cloned().collect()
    }

    /// Dirty fields mapped to their current values.
    pub fn changes(&self) -> Map<String, JsonValue> {
        let Ok(clean) = self.inner.clean.lock() else {
            return Map::new();
        };
        self.inner
            .fields
            .iter()
            .filter_map(|(name, cell)| {
                cell.with(|current| {
                    (clean.get(name) != Some(current)).then(|| (name.clone(), current.clone()))
                })
            })
            .collect()
    }

    fn refresh_dirty(&self) {
        let dirty = match self.inner.clean.lock() {
            Ok(clean) => self
                .inner
                .fields
                .iter()
                .any(|(name, cell)| cell.with(|current| clean.get(name) != Some(current))),
            Err(_) => return,
        };
        if self.inner.dirty.set(dirty) {
            self.notify_observers();
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle flags
    // ------------------------------------------------------------------

    /// True while a delete is pending or after it was confirmed.
    pub fn is_removed(&self) -> bool {
        self.inner.removed.get()
    }

    /// True while the entity exists only as an optimistic create.
    pub fn is_provisional(&self) -> bool {
        self.inner.provisional.get()
    }

    pub(crate) fn set_removed(&self, removed: bool) -> bool {
        let changed = self.inner.removed.set(removed);
        if changed {
            self.notify_observers();
        }
        changed
    }

    pub(crate) fn set_provisional(&self, provisional: bool) {
        if self.inner.provisional.set(provisional) {
            self.notify_observers();
        }
    }

    pub(crate) fn set_id(&self, id: M::Id) {
        if self.inner.id.set(id) {
            self.notify_observers();
        }
    }

    pub(crate) fn hydration_clock(&self) -> u64 {
        self.inner.hydrated_at.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Called once per batch whenever any field or flag of this entity changes.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let callback: Callback = Arc::new(callback);
        self.inner.observers.add(callback)
    }

    pub fn subscribe_field(
        &self,
        field: &str,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription> {
        Ok(self.cell(field)?.subscribe(callback))
    }

    fn notify_observers(&self) {
        self.inner.reactor.notify(self.inner.observers.snapshot());
    }

    fn cell(&self, field: &str) -> Result<&ObservableCell<JsonValue>> {
        self.inner
            .fields
            .get(field)
            .ok_or_else(|| CacheError::UnknownField {
                entity_type: M::ENTITY_TYPE.to_string(),
                field: field.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Attaches the update mutation `save()` delegates to.
    pub fn declare_update(&self, update: Arc<dyn EntitySave<M>>) {
        if let Ok(mut slot) = self.inner.update.write() {
            *slot = Some(update);
        }
    }

    pub fn has_update(&self) -> bool {
        self.inner
            .update
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Sends the local edits through the declared update mutation.
    ///
    /// Resolves to [`SaveOutcome::NoChanges`] without calling anything when
    /// the entity is not dirty.
    pub async fn save(&self) -> Result<SaveOutcome> {
        if !self.is_dirty() {
            return Ok(SaveOutcome::NoChanges);
        }

        let update = self.inner.update.read()?.clone();
        match update {
            Some(update) => update.save_entity(self).await,
            None => Err(CacheError::NoUpdateMutation(self.key().to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Manager / mutation internals
    // ------------------------------------------------------------------

    /// Merges one server record; returns payload keys that are not
    /// registered fields.
    pub(crate) fn hydrate(&self, record: &Map<String, JsonValue>, clock: u64) -> Vec<String> {
        let _batch = self.inner.reactor.begin_batch();
        let id_field = self.inner.schema.id_field_name();
        let mut unknown = Vec::new();
        let mut changed = false;

        if let Ok(mut clean) = self.inner.clean.lock() {
            for (name, incoming) in record {
                if name == id_field {
                    continue;
                }
                let Some(cell) = self.inner.fields.get(name) else {
                    if self.inner.schema.fragment_spec(name).is_none() {
                        unknown.push(name.clone());
                    }
                    continue;
                };

                let was_dirty = cell.with(|current| clean.get(name) != Some(current));
                clean.insert(name.clone(), incoming.clone());
                if !was_dirty {
                    changed |= cell.set(incoming.clone());
                }
            }
        }

        self.inner.hydrated_at.fetch_max(clock, Ordering::SeqCst);
        if changed {
            self.notify_observers();
        }
        self.refresh_dirty();
        unknown
    }

    /// Overwrites current and clean values with a server record, discarding
    /// local edits on the fields it carries.
    pub(crate) fn overwrite(&self, record: &Map<String, JsonValue>, clock: u64) {
        let _batch = self.inner.reactor.begin_batch();
        let mut changed = false;
        if let Ok(mut clean) = self.inner.clean.lock() {
            for (name, cell) in &self.inner.fields {
                if let Some(incoming) = record.get(name) {
                    clean.insert(name.clone(), incoming.clone());
                    changed |= cell.set(incoming.clone());
                }
            }
        }
        self.inner.hydrated_at.fetch_max(clock, Ordering::SeqCst);
        if changed {
            self.notify_observers();
        }
        self.refresh_dirty();
    }

    /// Marks the submitted values as saved.
    pub(crate) fn commit_clean(&self, submitted: &Map<String, JsonValue>) {
        let _batch = self.inner.reactor.begin_batch();
        if let Ok(mut clean) = self.inner.clean.lock() {
            for (name, value) in submitted {
                if self.inner.fields.contains_key(name) {
                    clean.insert(name.clone(), value.clone());
                }
            }
        }
        self.refresh_dirty();
    }

    /// Server-side edge change: written to the current value, and to the
    /// clean value unless the field carries a local edit.
    pub(crate) fn write_confirmed(&self, field: &str, value: JsonValue) -> Result<()> {
        let cell = self.cell(field)?;
        let _batch = self.inner.reactor.begin_batch();
        {
            let mut clean = self.inner.clean.lock()?;
            let was_dirty = cell.with(|current| clean.get(field) != Some(current));
            if !was_dirty {
                clean.insert(field.to_string(), value.clone());
            }
        }
        if cell.set(value) {
            self.notify_observers();
        }
        self.refresh_dirty();
        Ok(())
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        let values = self
            .inner
            .fields
            .iter()
            .map(|(name, cell)| (name.clone(), cell.get()))
            .collect();
        let clean = self
            .inner
            .clean
            .lock()
            .map(|clean| clean.clone())
            .unwrap_or_default();
        EntitySnapshot {
            values,
            clean,
            removed: self.is_removed(),
            clock: self.hydration_clock(),
        }
    }

    /// Replays the fields a snapshot carries; every other field is left
    /// alone. After a newer hydration the clean values stay, and a field that
    /// was clean at capture takes the newer clean value as its current value.
    pub(crate) fn restore(&self, snapshot: &EntitySnapshot) {
        let _batch = self.inner.reactor.begin_batch();
        let newer = self.hydration_clock() > snapshot.clock;
        let mut changed = false;

        if let Ok(mut clean) = self.inner.clean.lock() {
            for (name, value) in &snapshot.values {
                let Some(cell) = self.inner.fields.get(name) else {
                    continue;
                };
                let captured_clean = snapshot.clean.get(name);
                let target = match (newer, captured_clean == Some(value)) {
                    (true, true) => clean.get(name).cloned().unwrap_or_else(|| value.clone()),
                    _ => value.clone(),
                };
                changed |= cell.set(target);
                if !newer {
                    if let Some(captured) = captured_clean {
                        clean.insert(name.clone(), captured.clone());
                    }
                }
            }
        }

        changed |= self.inner.removed.set(snapshot.removed);
        if changed {
            self.notify_observers();
        }
        self.refresh_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntitySchema;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        title: String,
        #[serde(default)]
        meta: JsonValue,
    }

    impl EntityModel for Note {
        type Id = i64;
        const ENTITY_TYPE: &'static str = "note";

        fn schema() -> EntitySchema {
            EntitySchema::new(Self::ENTITY_TYPE).fields(["title", "meta"])
        }
    }

    fn note(title: &str) -> Entity<Note> {
        let entity = Entity::<Note>::new(Arc::new(Note::schema()), &Reactor::new(), 1);
        let record = json!({"id": 1, "title": title, "meta": {"tags": ["a"]}});
        entity.hydrate(record.as_object().unwrap(), 1);
        entity
    }

    #[test]
    fn test_set_back_to_clean_value_is_not_dirty() {
        let entity = note("first");
        entity.set("title", "edited").unwrap();
        assert!(entity.is_dirty());
        assert_eq!(entity.dirty_fields(), vec!["title".to_string()]);

        entity.set("title", "first").unwrap();
        assert!(!entity.is_dirty());
    }

    #[test]
    fn test_nested_values_compare_structurally() {
        let entity = note("first");
        entity.set("meta", json!({"tags": ["a"]})).unwrap();
        assert!(!entity.is_dirty());
        entity.set("meta", json!({"tags": ["a", "b"]})).unwrap();
        assert!(entity.is_field_dirty("meta"));
    }

    #[test]
    fn test_reset_restores_clean_values() {
        let entity = note("first");
        entity.set("title", "one").unwrap();
        entity.set("meta", json!(null)).unwrap();
        entity.reset();

        assert!(!entity.is_dirty());
        assert_eq!(entity.get_as::<String>("title").unwrap(), "first");
        assert_eq!(entity.get("meta"), Some(json!({"tags": ["a"]})));
    }

    #[test]
    fn test_hydrate_preserves_dirty_field() {
        let entity = note("first");
        entity.set("title", "local").unwrap();

        let refresh = json!({"id": 1, "title": "server", "meta": {"tags": []}});
        entity.hydrate(refresh.as_object().unwrap(), 2);

        assert_eq!(entity.get("title"), Some(json!("local")));
        assert_eq!(entity.clean_value("title"), Some(json!("server")));
        assert_eq!(entity.get("meta"), Some(json!({"tags": []})));
        assert!(entity.is_dirty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let entity = note("first");
        let err = entity.set("colour", "red").unwrap_err();
        assert!(matches!(err, CacheError::UnknownField { .. }));

        let mut values = Map::new();
        values.insert("title".to_string(), json!("x"));
        values.insert("colour".to_string(), json!("red"));
        assert!(entity.set_many(values).is_err());
        assert_eq!(entity.get("title"), Some(json!("first")));
    }

    #[test]
    fn test_set_many_notifies_once() {
        let entity = note("first");
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let _sub = entity.subscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        entity
            .set_data(&Note {
                id: 1,
                title: "second".to_string(),
                meta: json!({"tags": ["z"]}),
            })
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(entity.data().unwrap().title, "second");
        assert_eq!(entity.clean_data().unwrap().title, "first");
    }

    #[test]
    fn test_restore_keeps_newer_clean_values() {
        let entity = note("first");
        entity.set("title", "edit").unwrap();
        let snapshot = entity.snapshot();

        entity.set("title", "optimistic").unwrap();
        let refresh = json!({"id": 1, "title": "server"});
        entity.hydrate(refresh.as_object().unwrap(), 5);
        entity.restore(&snapshot);

        assert_eq!(entity.get("title"), Some(json!("edit")));
        assert_eq!(entity.clean_value("title"), Some(json!("server")));
    }

    #[test]
    fn test_narrowed_restore_leaves_other_fields() {
        let entity = note("first");
        let mut snapshot = entity.snapshot();
        snapshot.retain_fields(&["title"]);

        entity.set("title", "optimistic").unwrap();
        let refresh = json!({"id": 1, "title": "first", "meta": {"tags": ["b"]}});
        entity.hydrate(refresh.as_object().unwrap(), 5);
        entity.restore(&snapshot);

        assert_eq!(entity.get("title"), Some(json!("first")));
        assert_eq!(entity.get("meta"), Some(json!({"tags": ["b"]})));
        assert!(!entity.is_dirty());
    }

    #[test]
    fn test_restore_clean_field_takes_newer_server_value() {
        let entity = note("first");
        let snapshot = entity.snapshot();

        entity.set("title", "optimistic").unwrap();
        let refresh = json!({"id": 1, "title": "server"});
        entity.hydrate(refresh.as_object().unwrap(), 5);
        entity.restore(&snapshot);

        assert_eq!(entity.get("title"), Some(json!("server")));
        assert!(!entity.is_field_dirty("title"));
    }

    #[tokio::test]
    async fn test_save_without_changes_is_noop() {
        let entity = note("first");
        assert_eq!(entity.save().await.unwrap(), SaveOutcome::NoChanges);

        entity.set("title", "changed").unwrap();
        let err = entity.save().await.unwrap_err();
        assert!(matches!(err, CacheError::NoUpdateMutation(_)));
    }
}
