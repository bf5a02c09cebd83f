// ============================================================================
// Reactor: batched change notification
// ============================================================================
//
// Every observable write reports its subscribers to the reactor. Outside a
// batch they are called right away. Inside a batch they are queued, each
// subscriber at most once, and called when the outermost batch commits.
//
// ============================================================================

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Global subscriber ID counter
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Change callback registered on a cell or an entity.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct ReactorState {
    depth: usize,
    queued: HashSet<SubscriberId>,
    pending: Vec<Callback>,
    batches_committed: u64,
}

/// Shared batching scope for all cells created against it.
#[derive(Clone, Default)]
pub struct Reactor {
    state: Arc<Mutex<ReactorState>>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Reactor")
            .field("depth", &state.depth)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, ReactorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a batch. Notifications are held until the returned guard (and
    /// every enclosing guard) is dropped.
    pub fn begin_batch(&self) -> BatchGuard {
        self.lock_state().depth += 1;
        BatchGuard {
            reactor: self.clone(),
        }
    }

    fn end_batch(&self) {
        let ready = {
            let mut state = self.lock_state();
            state.depth = state.depth.saturating_sub(1);
            if state.depth > 0 {
                return;
            }
            state.queued.clear();
            state.batches_committed += 1;
            std::mem::take(&mut state.pending)
        };

        for callback in ready {
            callback();
        }
    }

    /// Runs `action` as one atomic batch of writes.
    pub fn run_in_action<R>(&self, action: impl FnOnce() -> R) -> R {
        let _batch = self.begin_batch();
        action()
    }

    pub fn is_batching(&self) -> bool {
        self.lock_state().depth > 0
    }

    /// Number of outermost batches committed so far.
    pub fn batches_committed(&self) -> u64 {
        self.lock_state().batches_committed
    }

    pub(crate) fn notify(&self, observers: Vec<(SubscriberId, Callback)>) {
        if observers.is_empty() {
            return;
        }

        let immediate = {
            let mut state = self.lock_state();
            if state.depth > 0 {
                for (id, callback) in observers {
                    if state.queued.insert(id) {
                        state.pending.push(callback);
                    }
                }
                Vec::new()
            } else {
                observers
            }
        };

        for (_, callback) in immediate {
            callback();
        }
    }
}

/// Closes its batch on drop.
#[must_use = "dropping the guard immediately commits the batch"]
pub struct BatchGuard {
    reactor: Reactor,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.reactor.end_batch();
    }
}

type ObserverMap = BTreeMap<SubscriberId, Callback>;

/// Subscriber registry shared by a cell or an entity.
#[derive(Clone, Default)]
pub(crate) struct ObserverList {
    inner: Arc<Mutex<ObserverMap>>,
}

impl ObserverList {
    fn lock(&self) -> MutexGuard<'_, ObserverMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, callback: Callback) -> Subscription {
        let id = SubscriberId::next();
        self.lock().insert(id, callback);
        Subscription {
            id,
            observers: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<(SubscriberId, Callback)> {
        self.lock()
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Handle to a registered observer; unsubscribes when dropped.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    id: SubscriberId,
    observers: Weak<Mutex<ObserverMap>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}
