use super::reactor::{Callback, ObserverList, Reactor, Subscription};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

struct CellInner<T> {
    value: RwLock<T>,
    observers: ObserverList,
    reactor: Reactor,
}

/// Reactive value cell. Writes that change the value notify subscribers
/// through the owning [`Reactor`].
pub struct ObservableCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for ObservableCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.inner.value.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_tuple("ObservableCell").field(&*value).finish()
    }
}

impl<T> ObservableCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(reactor: &Reactor, value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                value: RwLock::new(value),
                observers: ObserverList::default(),
                reactor: reactor.clone(),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        let value = self.inner.value.read().unwrap_or_else(PoisonError::into_inner);
        read(&value)
    }

    /// Writes `value`; returns whether it differed from the previous value.
    pub fn set(&self, value: T) -> bool {
        let changed = {
            let mut current = self
                .inner
                .value
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        };

        if changed {
            self.inner.reactor.notify(self.inner.observers.snapshot());
        }
        changed
    }

    /// Writes `value` and returns the previous one.
    pub fn replace(&self, value: T) -> T {
        let previous = self.get();
        self.set(value);
        previous
    }

    pub fn update(&self, edit: impl FnOnce(&mut T)) -> bool {
        let mut next = self.get();
        edit(&mut next);
        self.set(next)
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let callback: Callback = Arc::new(callback);
        self.inner.observers.add(callback)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
