// ============================================================================
// Entity Manager
// ============================================================================
//
// The one owned service holding the identity map. Create it once at start-up
// and hand clones (cheap, shared) to every query and mutation binding.
//
// All methods run to completion without suspending, so under cooperative
// scheduling no caller ever observes a half-applied hydration or release.
//
// ============================================================================

pub mod config;
pub(crate) mod identity_map;

pub use config::{EntityManagerConfig, EvictionPolicy};
pub use identity_map::InsertPosition;

use crate::core::{CacheError, EntityKey, JsonValue, QueryKey, Result};
use crate::entity::{Entity, EntityId, EntityModel, EntitySave};
use crate::observable::{ObservableCell, Reactor};
use identity_map::{IdentityMap, Released};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{Level, event, info_span};

/// Snapshot of identity map occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityManagerStats {
    pub entities: usize,
    pub query_keys: usize,
    pub per_type: BTreeMap<String, usize>,
}

struct ManagerShared {
    config: EntityManagerConfig,
    reactor: Reactor,
    map: RwLock<IdentityMap>,
    revisions: Mutex<HashMap<String, ObservableCell<u64>>>,
    key_claims: Mutex<HashMap<QueryKey, usize>>,
    single_keys: Mutex<HashSet<QueryKey>>,
    provisional_seq: AtomicU64,
}

#[derive(Clone)]
pub struct EntityManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("config", &self.shared.config)
            .field("entities", &self.len())
            .finish()
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::from_valid_config(EntityManagerConfig::default())
    }
}

impl EntityManager {
    pub fn new(config: EntityManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: EntityManagerConfig) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                map: RwLock::new(IdentityMap::new(config.eviction)),
                reactor: Reactor::new(),
                revisions: Mutex::new(HashMap::new()),
                key_claims: Mutex::new(HashMap::new()),
                single_keys: Mutex::new(HashSet::new()),
                provisional_seq: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &EntityManagerConfig {
        &self.shared.config
    }

    /// Batching scope shared by every entity this manager owns.
    pub fn reactor(&self) -> &Reactor {
        &self.shared.reactor
    }

    /// Runs `action` as one batch: observers see a single consistent update.
    pub fn run_in_action<R>(&self, action: impl FnOnce() -> R) -> R {
        self.shared.reactor.run_in_action(action)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Handle that does not keep the manager alive.
    pub fn downgrade(&self) -> WeakEntityManager {
        WeakEntityManager {
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IdentityMap>> {
        Ok(self.shared.map.read()?)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IdentityMap>> {
        Ok(self.shared.map.write()?)
    }

    /// Runs a write against the identity map, then bumps the revision of
    /// every type it structurally changed. Notifications go out once, after
    /// the map lock is released.
    fn mutate<R>(&self, op: impl FnOnce(&mut IdentityMap) -> Result<R>) -> Result<R> {
        let _batch = self.shared.reactor.begin_batch();
        let (result, touched) = {
            let mut map = self.write()?;
            let result = op(&mut map);
            (result, map.take_touched())
        };
        for entity_type in touched {
            self.revision(entity_type).update(|revision| *revision += 1);
        }
        result
    }

    /// Observable counter bumped whenever entities of `entity_type` are
    /// inserted, evicted, tombstoned or attached to a list.
    pub fn revision(&self, entity_type: &str) -> ObservableCell<u64> {
        let mut revisions = self
            .shared
            .revisions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        revisions
            .entry(entity_type.to_string())
            .or_insert_with(|| ObservableCell::new(&self.shared.reactor, 0))
            .clone()
    }

    pub(crate) fn bump_revision(&self, entity_type: &str) {
        self.revision(entity_type).update(|revision| *revision += 1);
    }

    // ------------------------------------------------------------------
    // Hydration
    // ------------------------------------------------------------------

    /// Merges raw records into their canonical entities and registers `key`
    /// as a referencer of each. Returns the shared instances in input order.
    pub fn hydrate<M: EntityModel>(
        &self,
        records: &[JsonValue],
        key: &QueryKey,
    ) -> Result<Vec<Entity<M>>> {
        let span = info_span!(
            "entity_hydrate",
            entity_type = M::ENTITY_TYPE,
            query_key = %key,
            records = records.len()
        );
        let _enter = span.enter();

        let reactor = self.shared.reactor.clone();
        let hydrated = self.mutate(|map| map.hydrate::<M>(records, key, &reactor))?;

        if !hydrated.unknown_fields.is_empty() {
            log::warn!(
                "ignored unregistered fields {:?} while hydrating '{}'",
                hydrated.unknown_fields,
                M::ENTITY_TYPE
            );
        }
        log_released(&hydrated.released);
        event!(Level::DEBUG, entities = hydrated.entities.len(), "hydrated");
        Ok(hydrated.entities)
    }

    /// Hydrates a single-record result. The key is remembered as holding
    /// one record, so optimistic creates never attach to it.
    pub fn hydrate_one<M: EntityModel>(&self, record: &JsonValue, key: &QueryKey) -> Result<Entity<M>> {
        let entity = self
            .hydrate::<M>(std::slice::from_ref(record), key)?
            .into_iter()
            .next()
            .ok_or_else(|| CacheError::invalid_payload(M::ENTITY_TYPE, "empty payload"))?;
        self.single_keys().insert(key.clone());
        Ok(entity)
    }

    fn single_keys(&self) -> std::sync::MutexGuard<'_, HashSet<QueryKey>> {
        self.shared
            .single_keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drops every claim `key` holds. Entities left without referencers or
    /// mutation holds are evicted (with `EvictionPolicy::Immediate`).
    /// Returns how many entities were evicted.
    pub fn release(&self, key: &QueryKey) -> usize {
        self.single_keys().remove(key);
        let released = self.mutate(|map| Ok(map.release(key)));
        match released {
            Ok(released) => {
                event!(Level::DEBUG, query_key = %key, evicted = released.evicted.len(), "released query key");
                log_released(&released);
                released.evicted.len()
            }
            Err(err) => {
                log::warn!("release of {} failed: {}", key, err);
                0
            }
        }
    }

    /// Registers one more binding on `key`.
    pub(crate) fn claim_key(&self, key: &QueryKey) {
        let mut claims = self
            .shared
            .key_claims
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *claims.entry(key.clone()).or_insert(0) += 1;
    }

    /// Drops one binding's claim on `key`; the last claim out releases the
    /// key. Returns how many entities were evicted.
    pub(crate) fn release_claim(&self, key: &QueryKey) -> usize {
        let last = {
            let mut claims = self
                .shared
                .key_claims
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match claims.get_mut(key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    claims.remove(key);
                    true
                }
                None => true,
            }
        };
        if last { self.release(key) } else { 0 }
    }

    /// Number of live bindings sharing `key`.
    pub fn key_claims(&self, key: &QueryKey) -> usize {
        self.shared
            .key_claims
            .lock()
            .map(|claims| claims.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Merges a server response into an entity that is already live.
    pub(crate) fn merge_server_record<M: EntityModel>(
        &self,
        record: &JsonValue,
        overwrite: bool,
    ) -> Result<Entity<M>> {
        self.mutate(|map| map.merge::<M>(record, overwrite))
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Read-only lookup; never fetches.
    pub fn get<M: EntityModel>(&self, id: &M::Id) -> Option<Entity<M>> {
        self.read().ok()?.get::<M>(id).ok().flatten()
    }

    pub fn contains<M: EntityModel>(&self, id: &M::Id) -> bool {
        self.get::<M>(id).is_some()
    }

    /// Query keys plus mutation holds claiming the entity.
    pub fn ref_count<M: EntityModel>(&self, id: &M::Id) -> usize {
        self.read()
            .and_then(|map| map.ref_count::<M>(id))
            .unwrap_or(0)
    }

    pub fn referencers<M: EntityModel>(&self, id: &M::Id) -> BTreeSet<QueryKey> {
        self.read()
            .and_then(|map| map.referencers::<M>(id))
            .unwrap_or_default()
    }

    /// Ordered list recorded for `key`, duplicates included. `None` when
    /// the key has never been hydrated (or was released).
    pub fn query_entities<M: EntityModel>(&self, key: &QueryKey) -> Result<Option<Vec<Entity<M>>>> {
        self.read()?.query_entities::<M>(key)
    }

    pub fn query_keys_for_type(&self, entity_type: &str) -> BTreeSet<QueryKey> {
        self.read()
            .map(|map| map.query_keys_for_type(entity_type))
            .unwrap_or_default()
    }

    /// Keys holding lists of `entity_type`: single-record and fragment
    /// keys are left out.
    pub fn list_keys_for_type(&self, entity_type: &str) -> BTreeSet<QueryKey> {
        let singles = self.single_keys().clone();
        self.query_keys_for_type(entity_type)
            .into_iter()
            .filter(|key| !key.is_fragment() && !singles.contains(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> EntityManagerStats {
        match self.read() {
            Ok(map) => EntityManagerStats {
                entities: map.len(),
                query_keys: map.query_key_count(),
                per_type: map.counts(),
            },
            Err(_) => EntityManagerStats {
                entities: 0,
                query_keys: 0,
                per_type: BTreeMap::new(),
            },
        }
    }

    // ------------------------------------------------------------------
    // Structural changes
    // ------------------------------------------------------------------

    /// Force-evicts an entity regardless of its claims. The instance is
    /// flagged removed so live handles can tell it is gone.
    pub fn remove<M: EntityModel>(&self, id: &M::Id) -> Result<bool> {
        let removed = self.mutate(|map| map.remove::<M>(id))?;
        if removed.is_some() {
            event!(Level::DEBUG, entity_type = M::ENTITY_TYPE, id = %id, "entity removed");
        }
        Ok(removed.is_some())
    }

    /// Adds an entity to the list recorded for `key`, registering the key
    /// as a referencer.
    pub fn attach<M: EntityModel>(
        &self,
        key: &QueryKey,
        entity: &Entity<M>,
        position: InsertPosition,
    ) -> Result<()> {
        let id = entity.id();
        self.mutate(|map| map.attach::<M>(key, &id, position))
    }

    /// Claims an entity on behalf of a mutation until the hold is dropped.
    pub fn hold<M: EntityModel>(&self, entity: &Entity<M>) -> Result<EntityHold> {
        let id = entity.id();
        self.mutate(|map| map.hold::<M>(&id))?;
        Ok(EntityHold::new::<M>(self.clone(), entity.clone()))
    }

    fn unhold<M: EntityModel>(&self, id: &M::Id) {
        match self.mutate(|map| map.unhold::<M>(id)) {
            Ok(released) => log_released(&released),
            Err(err) => log::warn!("dropping hold on {}:{} failed: {}", M::ENTITY_TYPE, id, err),
        }
    }

    /// Inserts a record held by the caller (no query key yet).
    pub(crate) fn insert_held<M: EntityModel>(&self, record: &JsonValue) -> Result<(Entity<M>, EntityHold)> {
        let reactor = self.shared.reactor.clone();
        let entity = self.mutate(|map| map.insert_held::<M>(record, &reactor))?;
        let hold = EntityHold::new::<M>(self.clone(), entity.clone());
        Ok((entity, hold))
    }

    /// Moves a provisional entity to its server-assigned id; merges into
    /// the live instance when that id is already present.
    pub fn rekey<M: EntityModel>(&self, old: &M::Id, new: &M::Id) -> Result<Entity<M>> {
        let entity = self.mutate(|map| map.rekey::<M>(old, new))?;
        event!(Level::DEBUG, entity_type = M::ENTITY_TYPE, from = %old, to = %new, "entity rekeyed");
        Ok(entity)
    }

    /// Evicts every entity without claims. Only needed with
    /// `EvictionPolicy::Deferred`; returns the number evicted.
    pub fn collect_garbage(&self) -> usize {
        match self.mutate(|map| Ok(map.collect_garbage())) {
            Ok(released) => {
                log_released(&released);
                released.evicted.len()
            }
            Err(err) => {
                log::warn!("garbage collection failed: {}", err);
                0
            }
        }
    }

    /// Gives every entity of `M` (existing and future) its own update
    /// mutation built by `factory`; `Entity::save` delegates to it.
    pub fn declare_update<M, F>(&self, factory: F) -> Result<()>
    where
        M: EntityModel,
        F: Fn() -> Arc<dyn EntitySave<M>> + Send + Sync + 'static,
    {
        self.write()?.declare_update::<M>(Arc::new(factory))
    }

    pub(crate) fn next_provisional_id<M: EntityModel>(&self) -> M::Id {
        let seq = self.shared.provisional_seq.fetch_add(1, Ordering::SeqCst);
        <M::Id as EntityId>::provisional(seq, &self.shared.config.provisional_prefix)
    }
}

/// Non-owning manager handle, see [`EntityManager::downgrade`].
#[derive(Clone)]
pub struct WeakEntityManager {
    shared: Weak<ManagerShared>,
}

impl WeakEntityManager {
    pub fn upgrade(&self) -> Option<EntityManager> {
        self.shared.upgrade().map(|shared| EntityManager { shared })
    }
}

impl fmt::Debug for WeakEntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEntityManager")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

fn log_released(released: &Released) {
    for key in &released.evicted {
        event!(Level::DEBUG, entity = %key, "entity evicted");
    }
}

/// Mutation claim on one entity; released (and the entity possibly
/// evicted) when dropped.
#[must_use = "dropping the hold releases the entity immediately"]
pub struct EntityHold {
    key: EntityKey,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl EntityHold {
    fn new<M: EntityModel>(manager: EntityManager, entity: Entity<M>) -> Self {
        Self {
            key: entity.key(),
            release: Some(Box::new(move || manager.unhold::<M>(&entity.id()))),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for EntityHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHold").field("key", &self.key).finish()
    }
}

impl Drop for EntityHold {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
