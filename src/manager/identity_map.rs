// ============================================================================
// Identity Map
// ============================================================================
//
// One table per entity type, keyed by id. Each slot holds the single live
// Entity plus its claims: the set of query keys that reference it and the
// number of mutation holds. A slot is evictable once both are empty.
//
// Ownership edges only run query key -> entity (and parent -> fragment key),
// so plain reference counting is enough; no cycle detection is needed.
//
// ============================================================================

use super::config::EvictionPolicy;
use crate::core::{CacheError, EntityKey, JsonValue, QueryKey, Result};
use crate::entity::{Entity, EntityModel, EntitySave, EntitySchema};
use crate::observable::Reactor;
use serde_json::Map;
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

pub(crate) type UpdateFactory<M> = Arc<dyn Fn() -> Arc<dyn EntitySave<M>> + Send + Sync>;

/// Where an attached entity goes in a recorded list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertPosition {
    Start,
    #[default]
    End,
}

/// Entities evicted by one operation, and fragment keys still to release.
#[derive(Debug, Default)]
pub(crate) struct Released {
    pub evicted: Vec<EntityKey>,
    pub cascade: Vec<QueryKey>,
}

impl Released {
    fn absorb(&mut self, other: Released) {
        self.evicted.extend(other.evicted);
        self.cascade.extend(other.cascade);
    }
}

pub(crate) struct Hydrated<M: EntityModel> {
    pub entities: Vec<Entity<M>>,
    pub unknown_fields: BTreeSet<String>,
    pub released: Released,
}

struct Slot<M: EntityModel> {
    entity: Entity<M>,
    referencers: BTreeSet<QueryKey>,
    holds: usize,
}

impl<M: EntityModel> Slot<M> {
    fn ref_count(&self) -> usize {
        self.referencers.len() + self.holds
    }
}

pub(crate) struct TypedTable<M: EntityModel> {
    schema: Arc<EntitySchema>,
    slots: HashMap<M::Id, Slot<M>>,
    results: HashMap<QueryKey, Vec<M::Id>>,
    update_factory: Option<UpdateFactory<M>>,
}

impl<M: EntityModel> TypedTable<M> {
    fn new(schema: EntitySchema) -> Self {
        Self {
            schema: Arc::new(schema),
            slots: HashMap::new(),
            results: HashMap::new(),
            update_factory: None,
        }
    }

    fn fragment_keys(&self, id: &M::Id) -> Vec<QueryKey> {
        let id = id.to_string();
        self.schema
            .fragments()
            .iter()
            .map(|fragment| QueryKey::fragment(M::ENTITY_TYPE, &id, &fragment.name))
            .collect()
    }

    fn upsert(
        &mut self,
        id: &M::Id,
        record: &Map<String, JsonValue>,
        clock: u64,
        reactor: &Reactor,
        unknown: &mut BTreeSet<String>,
    ) -> &mut Slot<M> {
        let slot = match self.slots.entry(id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let entity = Entity::new(Arc::clone(&self.schema), reactor, id.clone());
                if let Some(factory) = &self.update_factory {
                    entity.declare_update(factory());
                }
                entry.insert(Slot {
                    entity,
                    referencers: BTreeSet::new(),
                    holds: 0,
                })
            }
        };
        unknown.extend(slot.entity.hydrate(record, clock));
        slot
    }

    fn evict(&mut self, id: &M::Id, released: &mut Released) -> Option<Entity<M>> {
        let slot = self.slots.remove(id)?;
        released.evicted.push(slot.entity.key());
        released.cascade.extend(self.fragment_keys(id));
        Some(slot.entity)
    }

    fn drop_reference(
        &mut self,
        id: &M::Id,
        key: &QueryKey,
        eviction: EvictionPolicy,
        released: &mut Released,
    ) {
        let evictable = match self.slots.get_mut(id) {
            Some(slot) => {
                slot.referencers.remove(key);
                slot.ref_count() == 0
            }
            None => false,
        };
        if evictable && eviction == EvictionPolicy::Immediate {
            self.evict(id, released);
        }
    }
}

/// Type-erased view of a table so release and GC can walk every type.
pub(crate) trait ErasedTable: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn len(&self) -> usize;
    fn query_keys(&self) -> BTreeSet<QueryKey>;
    /// Drops `key`'s claims. `None` when the key never referenced this type.
    fn release(&mut self, key: &QueryKey, eviction: EvictionPolicy) -> Option<Released>;
    fn collect_garbage(&mut self) -> Released;
}

impl<M: EntityModel> ErasedTable for TypedTable<M> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn query_keys(&self) -> BTreeSet<QueryKey> {
        self.results.keys().cloned().collect()
    }

    fn release(&mut self, key: &QueryKey, eviction: EvictionPolicy) -> Option<Released> {
        let ids = self.results.remove(key)?;
        let mut released = Released::default();
        let unique: BTreeSet<M::Id> = ids.into_iter().collect();
        for id in unique {
            self.drop_reference(&id, key, eviction, &mut released);
        }
        Some(released)
    }

    fn collect_garbage(&mut self) -> Released {
        let mut released = Released::default();
        let unreferenced: Vec<M::Id> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.ref_count() == 0)
            .map(|(id, _)| id.clone())
            .collect();
        for id in unreferenced {
            self.evict(&id, &mut released);
        }
        released
    }
}

/// Seeds a fragment's child entities from the parent payload.
pub(crate) trait FragmentSeed: Send + Sync {
    fn seed(
        &self,
        map: &mut IdentityMap,
        key: &QueryKey,
        payload: &JsonValue,
        reactor: &Reactor,
    ) -> Result<Released>;
}

pub(crate) struct TypedFragmentSeed<C>(PhantomData<fn() -> C>);

impl<C> TypedFragmentSeed<C> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<C: EntityModel> FragmentSeed for TypedFragmentSeed<C> {
    fn seed(
        &self,
        map: &mut IdentityMap,
        key: &QueryKey,
        payload: &JsonValue,
        reactor: &Reactor,
    ) -> Result<Released> {
        let records = fragment_records(payload);
        Ok(map.hydrate::<C>(&records, key, reactor)?.released)
    }
}

/// A fragment payload may be a list, a single record, or null.
pub(crate) fn fragment_records(payload: &JsonValue) -> Vec<JsonValue> {
    match payload {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn parse_record<'a, M: EntityModel>(
    schema: &EntitySchema,
    record: &'a JsonValue,
) -> Result<(M::Id, &'a Map<String, JsonValue>)> {
    let JsonValue::Object(fields) = record else {
        return Err(CacheError::invalid_payload(
            M::ENTITY_TYPE,
            "record is not an object",
        ));
    };
    let raw_id = fields.get(schema.id_field_name()).ok_or_else(|| {
        CacheError::invalid_payload(
            M::ENTITY_TYPE,
            format!("missing id field '{}'", schema.id_field_name()),
        )
    })?;
    let id = serde_json::from_value::<M::Id>(raw_id.clone()).map_err(|err| {
        CacheError::invalid_payload(M::ENTITY_TYPE, format!("invalid id {}: {}", raw_id, err))
    })?;
    Ok((id, fields))
}

pub(crate) struct IdentityMap {
    tables: HashMap<&'static str, Box<dyn ErasedTable>>,
    eviction: EvictionPolicy,
    clock: u64,
    touched: BTreeSet<&'static str>,
}

impl IdentityMap {
    pub(crate) fn new(eviction: EvictionPolicy) -> Self {
        Self {
            tables: HashMap::new(),
            eviction,
            clock: 0,
            touched: BTreeSet::new(),
        }
    }

    /// Entity types structurally changed since the last call.
    pub(crate) fn take_touched(&mut self) -> BTreeSet<&'static str> {
        std::mem::take(&mut self.touched)
    }

    fn table_mut<M: EntityModel>(&mut self) -> Result<&mut TypedTable<M>> {
        let table = match self.tables.entry(M::ENTITY_TYPE) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let schema = M::schema();
                if schema.entity_type() != M::ENTITY_TYPE {
                    return Err(CacheError::Config(format!(
                        "schema declares type '{}' for model '{}'",
                        schema.entity_type(),
                        M::ENTITY_TYPE
                    )));
                }
                entry.insert(Box::new(TypedTable::<M>::new(schema)))
            }
        };
        table
            .as_any_mut()
            .downcast_mut::<TypedTable<M>>()
            .ok_or_else(|| CacheError::TypeMismatch(M::ENTITY_TYPE.to_string()))
    }

    fn table<M: EntityModel>(&self) -> Result<Option<&TypedTable<M>>> {
        match self.tables.get(M::ENTITY_TYPE) {
            None => Ok(None),
            Some(table) => table
                .as_any()
                .downcast_ref::<TypedTable<M>>()
                .map(Some)
                .ok_or_else(|| CacheError::TypeMismatch(M::ENTITY_TYPE.to_string())),
        }
    }

    /// Merges `records` into their canonical entities and records them, in
    /// order, as the result of `key`.
    pub(crate) fn hydrate<M: EntityModel>(
        &mut self,
        records: &[JsonValue],
        key: &QueryKey,
        reactor: &Reactor,
    ) -> Result<Hydrated<M>> {
        self.clock += 1;
        let clock = self.clock;
        let eviction = self.eviction;
        let mut released = Released::default();
        let mut unknown_fields = BTreeSet::new();
        let mut seeds = Vec::new();

        let entities = {
            let table = self.table_mut::<M>()?;
            let schema = Arc::clone(&table.schema);
            let parsed = records
                .iter()
                .map(|record| parse_record::<M>(&schema, record))
                .collect::<Result<Vec<_>>>()?;

            let mut entities = Vec::with_capacity(parsed.len());
            let mut ids = Vec::with_capacity(parsed.len());
            for (id, record) in parsed {
                let slot = table.upsert(&id, record, clock, reactor, &mut unknown_fields);
                slot.referencers.insert(key.clone());
                entities.push(slot.entity.clone());

                for fragment in schema.fragments() {
                    if let Some(payload) = record.get(&fragment.name) {
                        seeds.push((
                            Arc::clone(&fragment.seed),
                            QueryKey::fragment(M::ENTITY_TYPE, &id.to_string(), &fragment.name),
                            payload.clone(),
                        ));
                    }
                }
                ids.push(id);
            }

            let current: HashSet<M::Id> = ids.iter().cloned().collect();
            let previous = table.results.insert(key.clone(), ids).unwrap_or_default();
            let stale: BTreeSet<M::Id> = previous
                .into_iter()
                .filter(|id| !current.contains(id))
                .collect();
            for id in stale {
                table.drop_reference(&id, key, eviction, &mut released);
            }
            entities
        };
        self.touched.insert(M::ENTITY_TYPE);

        for (seed, fragment_key, payload) in seeds {
            released.absorb(seed.seed(self, &fragment_key, &payload, reactor)?);
        }
        self.release_cascade(&mut released);

        Ok(Hydrated {
            entities,
            unknown_fields,
            released,
        })
    }

    /// Inserts (or merges) one record with a mutation hold and no query key.
    pub(crate) fn insert_held<M: EntityModel>(
        &mut self,
        record: &JsonValue,
        reactor: &Reactor,
    ) -> Result<Entity<M>> {
        self.clock += 1;
        let clock = self.clock;
        let table = self.table_mut::<M>()?;
        let schema = Arc::clone(&table.schema);
        let (id, fields) = parse_record::<M>(&schema, record)?;
        let mut unknown = BTreeSet::new();
        let slot = table.upsert(&id, fields, clock, reactor, &mut unknown);
        slot.holds += 1;
        let entity = slot.entity.clone();
        self.touched.insert(M::ENTITY_TYPE);
        Ok(entity)
    }

    /// Merges a server record into an entity that is already live. With
    /// `overwrite` the record also replaces local edits.
    pub(crate) fn merge<M: EntityModel>(
        &mut self,
        record: &JsonValue,
        overwrite: bool,
    ) -> Result<Entity<M>> {
        self.clock += 1;
        let clock = self.clock;
        let table = self.table_mut::<M>()?;
        let schema = Arc::clone(&table.schema);
        let (id, fields) = parse_record::<M>(&schema, record)?;
        let slot = table
            .slots
            .get(&id)
            .ok_or_else(|| CacheError::EntityNotFound {
                entity_type: M::ENTITY_TYPE.to_string(),
                id: id.to_string(),
            })?;
        if overwrite {
            slot.entity.overwrite(fields, clock);
        } else {
            slot.entity.hydrate(fields, clock);
        }
        Ok(slot.entity.clone())
    }

    pub(crate) fn get<M: EntityModel>(&self, id: &M::Id) -> Result<Option<Entity<M>>> {
        Ok(self
            .table::<M>()?
            .and_then(|table| table.slots.get(id))
            .map(|slot| slot.entity.clone()))
    }

    pub(crate) fn ref_count<M: EntityModel>(&self, id: &M::Id) -> Result<usize> {
        Ok(self
            .table::<M>()?
            .and_then(|table| table.slots.get(id))
            .map(Slot::ref_count)
            .unwrap_or(0))
    }

    pub(crate) fn referencers<M: EntityModel>(&self, id: &M::Id) -> Result<BTreeSet<QueryKey>> {
        Ok(self
            .table::<M>()?
            .and_then(|table| table.slots.get(id))
            .map(|slot| slot.referencers.clone())
            .unwrap_or_default())
    }

    pub(crate) fn query_entities<M: EntityModel>(
        &self,
        key: &QueryKey,
    ) -> Result<Option<Vec<Entity<M>>>> {
        let Some(table) = self.table::<M>()? else {
            return Ok(None);
        };
        Ok(table.results.get(key).map(|ids| {
            ids.iter()
                .filter_map(|id| table.slots.get(id))
                .map(|slot| slot.entity.clone())
                .collect()
        }))
    }

    pub(crate) fn attach<M: EntityModel>(
        &mut self,
        key: &QueryKey,
        id: &M::Id,
        position: InsertPosition,
    ) -> Result<()> {
        let table = self.table_mut::<M>()?;
        let slot = table
            .slots
            .get_mut(id)
            .ok_or_else(|| CacheError::EntityNotFound {
                entity_type: M::ENTITY_TYPE.to_string(),
                id: id.to_string(),
            })?;
        slot.referencers.insert(key.clone());

        let list = table.results.entry(key.clone()).or_default();
        if !list.contains(id) {
            match position {
                InsertPosition::Start => list.insert(0, id.clone()),
                InsertPosition::End => list.push(id.clone()),
            }
        }
        self.touched.insert(M::ENTITY_TYPE);
        Ok(())
    }

    pub(crate) fn hold<M: EntityModel>(&mut self, id: &M::Id) -> Result<()> {
        let table = self.table_mut::<M>()?;
        let slot = table
            .slots
            .get_mut(id)
            .ok_or_else(|| CacheError::EntityNotFound {
                entity_type: M::ENTITY_TYPE.to_string(),
                id: id.to_string(),
            })?;
        slot.holds += 1;
        Ok(())
    }

    pub(crate) fn unhold<M: EntityModel>(&mut self, id: &M::Id) -> Result<Released> {
        let eviction = self.eviction;
        let table = self.table_mut::<M>()?;
        let mut released = Released::default();
        let evictable = match table.slots.get_mut(id) {
            Some(slot) => {
                slot.holds = slot.holds.saturating_sub(1);
                slot.ref_count() == 0
            }
            None => false,
        };
        if evictable && eviction == EvictionPolicy::Immediate {
            table.evict(id, &mut released);
            self.touched.insert(M::ENTITY_TYPE);
        }
        self.release_cascade(&mut released);
        Ok(released)
    }

    /// Force-evicts regardless of claims and strips the id from every list.
    pub(crate) fn remove<M: EntityModel>(&mut self, id: &M::Id) -> Result<Option<Entity<M>>> {
        let table = self.table_mut::<M>()?;
        let mut released = Released::default();
        let Some(entity) = table.evict(id, &mut released) else {
            return Ok(None);
        };
        for ids in table.results.values_mut() {
            ids.retain(|listed| listed != id);
        }
        entity.set_removed(true);
        self.touched.insert(M::ENTITY_TYPE);
        self.release_cascade(&mut released);
        Ok(Some(entity))
    }

    /// Moves the entity at `old` to `new`. When `new` is already live the
    /// two are merged into the existing instance, which is returned.
    pub(crate) fn rekey<M: EntityModel>(&mut self, old: &M::Id, new: &M::Id) -> Result<Entity<M>> {
        let table = self.table_mut::<M>()?;
        let not_found = || CacheError::EntityNotFound {
            entity_type: M::ENTITY_TYPE.to_string(),
            id: old.to_string(),
        };
        if old == new {
            return table
                .slots
                .get(old)
                .map(|slot| slot.entity.clone())
                .ok_or_else(not_found);
        }

        let mut slot = table.slots.remove(old).ok_or_else(not_found)?;
        for ids in table.results.values_mut() {
            if ids.contains(new) {
                ids.retain(|listed| listed != old);
            } else {
                for listed in ids.iter_mut().filter(|listed| *listed == old) {
                    *listed = new.clone();
                }
            }
        }

        let mut released = Released {
            evicted: Vec::new(),
            cascade: table.fragment_keys(old),
        };
        slot.entity.set_id(new.clone());
        let entity = match table.slots.get_mut(new) {
            Some(existing) => {
                existing.referencers.append(&mut slot.referencers);
                existing.holds += slot.holds;
                slot.entity.set_removed(true);
                released.evicted.push(EntityKey::new(M::ENTITY_TYPE, old));
                existing.entity.clone()
            }
            None => {
                let entity = slot.entity.clone();
                table.slots.insert(new.clone(), slot);
                entity
            }
        };
        self.touched.insert(M::ENTITY_TYPE);
        self.release_cascade(&mut released);
        Ok(entity)
    }

    pub(crate) fn declare_update<M: EntityModel>(&mut self, factory: UpdateFactory<M>) -> Result<()> {
        let table = self.table_mut::<M>()?;
        for slot in table.slots.values() {
            slot.entity.declare_update(factory());
        }
        table.update_factory = Some(factory);
        Ok(())
    }

    fn release_one(&mut self, key: &QueryKey) -> Released {
        let mut released = Released::default();
        for (entity_type, table) in self.tables.iter_mut() {
            if let Some(table_released) = table.release(key, self.eviction) {
                self.touched.insert(*entity_type);
                released.absorb(table_released);
            }
        }
        released
    }

    fn release_cascade(&mut self, released: &mut Released) {
        let mut pending: VecDeque<QueryKey> = std::mem::take(&mut released.cascade).into();
        while let Some(key) = pending.pop_front() {
            let next = self.release_one(&key);
            released.evicted.extend(next.evicted);
            pending.extend(next.cascade);
        }
    }

    /// Drops every claim `key` holds, cascading into fragment keys of
    /// evicted parents.
    pub(crate) fn release(&mut self, key: &QueryKey) -> Released {
        let mut released = self.release_one(key);
        self.release_cascade(&mut released);
        released
    }

    pub(crate) fn collect_garbage(&mut self) -> Released {
        let mut total = Released::default();
        loop {
            let mut round = Released::default();
            for (entity_type, table) in self.tables.iter_mut() {
                let table_released = table.collect_garbage();
                if !table_released.evicted.is_empty() {
                    self.touched.insert(*entity_type);
                }
                round.absorb(table_released);
            }
            if round.evicted.is_empty() {
                break;
            }
            self.release_cascade(&mut round);
            total.absorb(round);
        }
        total
    }

    pub(crate) fn len(&self) -> usize {
        self.tables.values().map(|table| table.len()).sum()
    }

    pub(crate) fn counts(&self) -> BTreeMap<String, usize> {
        self.tables
            .iter()
            .map(|(entity_type, table)| (entity_type.to_string(), table.len()))
            .collect()
    }

    pub(crate) fn query_keys_for_type(&self, entity_type: &str) -> BTreeSet<QueryKey> {
        self.tables
            .get(entity_type)
            .map(|table| table.query_keys())
            .unwrap_or_default()
    }

    pub(crate) fn query_key_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|table| table.query_keys())
            .collect::<BTreeSet<_>>()
            .len()
    }
}
