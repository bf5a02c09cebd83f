// ============================================================================
// Query layer
// ============================================================================
//
// The async query cache seam, a bundled in-memory cache, and the bindings
// that turn cached payloads into shared entities:
// - QueryOne: one record (or null) per key
// - QueryMany: an ordered list per key
// - QueryFragment: a list owned by a parent entity
//
// ============================================================================

pub(crate) mod binding;
pub mod cache;
pub mod config;
pub mod fragment;
pub mod many;
pub mod memory;
pub mod one;
pub mod options;
pub mod state;

pub use binding::QuerySubscription;
pub use cache::{
    InvalidateFilter, ListenerId, MutationCall, QueryCache, QueryFetcher, QueryListener, fetcher,
    mutation_call,
};
pub use config::QueryCacheConfig;
pub use fragment::QueryFragment;
pub use many::QueryMany;
pub use memory::{InMemoryQueryCache, QueryCacheStats};
pub use one::QueryOne;
pub use options::{QueryOptions, Select};
pub use state::{QueryState, QueryStatus};
