// ============================================================================
// Binding core shared by QueryOne, QueryMany and QueryFragment
// ============================================================================
//
// A binding wraps one query key. Fetch outcomes (its own, or refetches the
// cache runs after an invalidation) are hydrated into the entity manager and
// the binding's reactive status follows along.
//
// Release ordering: the key is released only once the binding is disposed
// AND no fetch is in flight, so a late response can never leave claims behind
// and a release can never interrupt a hydration.
//
// ============================================================================

use super::cache::{InvalidateFilter, ListenerId, QueryCache, QueryListener};
use super::options::QueryOptions;
use super::state::{QueryState, QueryStatus};
use crate::core::{CacheError, JsonValue, QueryKey, Result};
use crate::entity::{Entity, EntityModel};
use crate::manager::EntityManager;
use crate::manager::identity_map::fragment_records;
use crate::observable::{Callback, ObservableCell, Subscription};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Instrument, Level, event, info_span};

/// Tells a fragment whether its parent entity is still live.
pub(crate) type ParentCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub(crate) enum Shape {
    /// Payload is one record (or null).
    One,
    /// Payload is a list of records.
    Many,
    /// List seeded from a parent payload; the key belongs to the parent.
    Fragment(ParentCheck),
}

#[derive(Default)]
struct Lifecycle {
    inflight: usize,
    disposed: bool,
    released: bool,
    listener: Option<ListenerId>,
}

pub(crate) struct BindingCore<M: EntityModel> {
    options: QueryOptions,
    manager: EntityManager,
    cache: Arc<dyn QueryCache>,
    shape: Shape,
    status: ObservableCell<QueryStatus>,
    error: ObservableCell<Option<CacheError>>,
    fetching: ObservableCell<bool>,
    lifecycle: Mutex<Lifecycle>,
    _model: PhantomData<fn() -> M>,
}

impl<M: EntityModel> BindingCore<M> {
    pub(crate) fn new(
        manager: EntityManager,
        cache: Arc<dyn QueryCache>,
        options: QueryOptions,
        shape: Shape,
    ) -> Arc<Self> {
        if !matches!(shape, Shape::Fragment(_)) {
            manager.claim_key(&options.key);
        }

        // Another binding (or a parent payload) may already have filled the key.
        let seeded = matches!(manager.query_entities::<M>(&options.key), Ok(Some(_)));
        let initial = if seeded {
            QueryStatus::Ready
        } else {
            QueryStatus::Idle
        };
        let reactor = manager.reactor().clone();

        Arc::new(Self {
            status: ObservableCell::new(&reactor, initial),
            error: ObservableCell::new(&reactor, None),
            fetching: ObservableCell::new(&reactor, false),
            lifecycle: Mutex::new(Lifecycle::default()),
            _model: PhantomData,
            options,
            manager,
            cache,
            shape,
        })
    }

    pub(crate) fn key(&self) -> &QueryKey {
        &self.options.key
    }

    pub(crate) fn manager(&self) -> &EntityManager {
        &self.manager
    }

    pub(crate) fn status(&self) -> QueryStatus {
        self.status.get()
    }

    pub(crate) fn error(&self) -> Option<CacheError> {
        self.error.get()
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.fetching.get()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.lifecycle().disposed
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live entities recorded for the key, in server order. Tombstoned
    /// entities are left out.
    pub(crate) fn entities(&self) -> Vec<Entity<M>> {
        match self.manager.query_entities::<M>(&self.options.key) {
            Ok(Some(entities)) => entities
                .into_iter()
                .filter(|entity| !entity.is_removed())
                .collect(),
            Ok(None) => Vec::new(),
            Err(err) => {
                log::warn!("reading {} failed: {}", self.options.key, err);
                Vec::new()
            }
        }
    }

    pub(crate) fn state<T>(&self, ready: impl FnOnce() -> T) -> QueryState<T> {
        match self.status.get() {
            QueryStatus::Idle => QueryState::Idle,
            QueryStatus::Pending => QueryState::Pending,
            QueryStatus::Ready => QueryState::Ready(ready()),
            QueryStatus::Failed => match self.error.get() {
                Some(err) => QueryState::Failed(err),
                None => QueryState::Pending,
            },
        }
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    fn begin_fetch(self: &Arc<Self>) -> Result<InflightGuard<M>> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.disposed {
                return Err(CacheError::Disposed(self.options.key.to_string()));
            }
            lifecycle.inflight += 1;
            if lifecycle.listener.is_none() {
                lifecycle.listener = Some(self.register_listener());
            }
        }

        let _batch = self.manager.reactor().begin_batch();
        self.fetching.set(true);
        if self.status.get() != QueryStatus::Ready {
            self.status.set(QueryStatus::Pending);
        }
        Ok(InflightGuard {
            core: Arc::clone(self),
        })
    }

    fn register_listener(self: &Arc<Self>) -> ListenerId {
        let weak = Arc::downgrade(self);
        let listener: QueryListener = Arc::new(move |key, outcome| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            // Failures are already recorded in the status cells
            if let Err(err) = core.settle(outcome.clone()) {
                event!(Level::DEBUG, query_key = %key, error = %err, "refetch outcome not applied");
            }
        });
        self.cache.subscribe(
            &self.options.key,
            M::ENTITY_TYPE,
            Arc::clone(&self.options.fetcher),
            listener,
        )
    }

    pub(crate) async fn fetch(self: &Arc<Self>) -> Result<()> {
        let _guard = self.begin_fetch()?;
        let span = info_span!(
            "query_fetch",
            query_key = %self.options.key,
            entity_type = M::ENTITY_TYPE
        );
        let outcome = self
            .cache
            .fetch(&self.options.key, Arc::clone(&self.options.fetcher))
            .instrument(span)
            .await;
        self.settle(outcome)
    }

    /// Marks the key stale so the cache refetches it; every binding on the
    /// key receives the outcome through its listener.
    pub(crate) async fn refetch(self: &Arc<Self>) -> Result<()> {
        let _guard = self.begin_fetch()?;
        let span = info_span!("query_refetch", query_key = %self.options.key);
        self.cache
            .invalidate(InvalidateFilter::Key(self.options.key.clone()))
            .instrument(span)
            .await;
        match self.error.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn settle(&self, outcome: Result<JsonValue>) -> Result<()> {
        if self.is_disposed() {
            event!(Level::DEBUG, query_key = %self.options.key, "discarding response of disposed binding");
            return Err(CacheError::Disposed(self.options.key.to_string()));
        }

        let applied = outcome.and_then(|payload| self.apply(&payload));
        let _batch = self.manager.reactor().begin_batch();
        match &applied {
            Ok(()) => {
                self.error.set(None);
                self.status.set(QueryStatus::Ready);
            }
            Err(err) => {
                event!(Level::DEBUG, query_key = %self.options.key, error = %err, "query failed");
                self.error.set(Some(err.clone()));
                self.status.set(QueryStatus::Failed);
            }
        }
        applied
    }

    fn apply(&self, payload: &JsonValue) -> Result<()> {
        let key = &self.options.key;
        let selected = self.options.extract(payload)?;
        match &self.shape {
            Shape::One => {
                if selected.is_null() {
                    self.manager.release(key);
                } else {
                    self.manager.hydrate_one::<M>(&selected, key)?;
                }
            }
            Shape::Many => {
                let records = match selected {
                    JsonValue::Array(records) => records,
                    JsonValue::Null => Vec::new(),
                    _ => {
                        return Err(CacheError::invalid_payload(
                            M::ENTITY_TYPE,
                            format!("expected a list for {}", key),
                        ));
                    }
                };
                self.manager.hydrate::<M>(&records, key)?;
            }
            Shape::Fragment(parent_alive) => {
                if !parent_alive() {
                    return Err(CacheError::Disposed(key.to_string()));
                }
                self.manager.hydrate::<M>(&fragment_records(&selected), key)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------

    pub(crate) fn dispose(&self) {
        let (listener, release_now) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.disposed {
                return;
            }
            lifecycle.disposed = true;
            let release_now = lifecycle.inflight == 0;
            if release_now {
                lifecycle.released = true;
            }
            (lifecycle.listener.take(), release_now)
        };

        if let Some(listener) = listener {
            self.cache.unsubscribe(&self.options.key, listener);
        }
        if release_now {
            self.release_key();
        }
        event!(Level::DEBUG, query_key = %self.options.key, deferred = !release_now, "query binding disposed");
    }

    fn release_key(&self) {
        if !matches!(self.shape, Shape::Fragment(_)) {
            self.manager.release_claim(&self.options.key);
        }
    }

    pub(crate) fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> QuerySubscription {
        let callback: Callback = Arc::new(callback);
        let relay = || {
            let callback = Arc::clone(&callback);
            move || callback()
        };
        QuerySubscription {
            subscriptions: vec![
                self.status.subscribe(relay()),
                self.error.subscribe(relay()),
                self.fetching.subscribe(relay()),
                self.manager.revision(M::ENTITY_TYPE).subscribe(relay()),
            ],
        }
    }
}

impl<M: EntityModel> Drop for BindingCore<M> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Counts one fetch in flight; the last one out of a disposed binding
/// performs the deferred release.
struct InflightGuard<M: EntityModel> {
    core: Arc<BindingCore<M>>,
}

impl<M: EntityModel> Drop for InflightGuard<M> {
    fn drop(&mut self) {
        let (idle, release_now) = {
            let mut lifecycle = self.core.lifecycle();
            lifecycle.inflight = lifecycle.inflight.saturating_sub(1);
            let idle = lifecycle.inflight == 0;
            let release_now = idle && lifecycle.disposed && !lifecycle.released;
            if release_now {
                lifecycle.released = true;
            }
            (idle, release_now)
        };
        if idle {
            self.core.fetching.set(false);
        }
        if release_now {
            self.core.release_key();
        }
    }
}

/// Observes a binding's status plus structural changes of its entity type.
/// Unsubscribes when dropped.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct QuerySubscription {
    subscriptions: Vec<Subscription>,
}

impl QuerySubscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("cells", &self.subscriptions.len())
            .finish()
    }
}
