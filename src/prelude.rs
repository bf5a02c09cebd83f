//! Recommended API entrypoints grouped by abstraction level.
//!
//! `app` is the stable default for application code.
//! `advanced` is an explicit escape hatch for the identity map and the
//! cache seam.

pub mod app {
    //! Stable high-level surface for application code.
    //!
    //! Intended usage:
    //! - `EntityModel` + `EntitySchema` registration per entity type,
    //! - `EntityStore` bootstrap,
    //! - query and mutation bindings built from the store.
    pub use crate::{
        AttachTarget, CacheError, CreateOptions, Entity, EntityModel, EntitySchema, EntityStore,
        InvalidationStrategy, MutationPhase, QueryKey, QueryOptions, QueryState, QueryStatus,
        Result, SaveOutcome, fetcher, mutation_fn,
    };
}

pub mod advanced {
    //! Escape hatch for identity map and cache internals.
    //!
    //! App-level code should normally stay on `prelude::app`.
    pub use crate::manager::{EntityHold, EntityManager, EntityManagerStats, EvictionPolicy};
    pub use crate::mutation::{MutationMachine, MutationRecord};
    pub use crate::observable::{BatchGuard, ObservableCell, Reactor};
    pub use crate::query::{
        InMemoryQueryCache, InvalidateFilter, ListenerId, QueryCache, QueryListener,
    };
}
