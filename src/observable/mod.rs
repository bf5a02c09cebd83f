//! Minimal observable substrate: value cells with explicit subscriber
//! registration and begin/commit batching.

pub mod cell;
pub mod reactor;

pub use cell::ObservableCell;
pub use reactor::{BatchGuard, Callback, Reactor, SubscriberId, Subscription};
pub(crate) use reactor::ObserverList;
