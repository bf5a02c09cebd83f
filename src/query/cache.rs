use crate::core::{CacheError, JsonValue, QueryKey, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Produces the raw payload for a query key.
pub type QueryFetcher = Arc<dyn Fn(QueryKey) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

/// Receives the outcome of a refetch the cache ran on its own (after an
/// invalidation).
pub type QueryListener = Arc<dyn Fn(&QueryKey, &Result<JsonValue>) + Send + Sync>;

/// One attempt of a mutation's network call. The cache may invoke it more
/// than once when it retries.
pub type MutationCall = Arc<dyn Fn() -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

pub fn fetcher<F, Fut>(fetch: F) -> QueryFetcher
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue>> + Send + 'static,
{
    Arc::new(move |key| Box::pin(fetch(key)))
}

pub fn mutation_call<F, Fut>(call: F) -> MutationCall
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue>> + Send + 'static,
{
    Arc::new(move || Box::pin(call()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Which cached queries an invalidation marks stale.
#[derive(Clone)]
pub enum InvalidateFilter {
    Key(QueryKey),
    Prefix(QueryKey),
    Keys(BTreeSet<QueryKey>),
    All,
    Predicate(Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>),
}

impl InvalidateFilter {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            InvalidateFilter::Key(target) => target == key,
            InvalidateFilter::Prefix(prefix) => key.starts_with(prefix),
            InvalidateFilter::Keys(keys) => keys.contains(key),
            InvalidateFilter::All => true,
            InvalidateFilter::Predicate(predicate) => predicate(key),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, InvalidateFilter::Keys(keys) if keys.is_empty())
    }
}

impl fmt::Debug for InvalidateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidateFilter::Key(key) => f.debug_tuple("Key").field(key).finish(),
            InvalidateFilter::Prefix(key) => f.debug_tuple("Prefix").field(key).finish(),
            InvalidateFilter::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            InvalidateFilter::All => write!(f, "All"),
            InvalidateFilter::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// The async query/mutation cache the entity layer sits on.
///
/// Fetching, retries, staleness and key indexing live behind this seam.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Returns cached data when fresh, otherwise runs `fetcher`.
    async fn fetch(&self, key: &QueryKey, fetcher: QueryFetcher) -> Result<JsonValue>;

    /// Registers an active observer of `key` holding entities of `entity_type`.
    fn subscribe(
        &self,
        key: &QueryKey,
        entity_type: &str,
        fetcher: QueryFetcher,
        listener: QueryListener,
    ) -> ListenerId;

    fn unsubscribe(&self, key: &QueryKey, listener: ListenerId);

    /// Marks matching queries stale and refetches those with observers,
    /// dispatching each outcome to the observers' listeners.
    async fn invalidate(&self, filter: InvalidateFilter) -> Vec<QueryKey>;

    fn active_keys_for_entity_type(&self, entity_type: &str) -> BTreeSet<QueryKey>;

    fn active_keys(&self) -> BTreeSet<QueryKey>;

    /// Runs a mutation's network call under the cache's retry policy. A
    /// returned error is terminal.
    async fn execute_mutation(&self, call: MutationCall) -> Result<JsonValue>;
}

/// Keeps fetch errors as they are; labels anything else as a fetch failure
/// of `key`.
pub(crate) fn as_fetch_error(key: &QueryKey, err: CacheError) -> CacheError {
    match err {
        err @ CacheError::Fetch { .. } => err,
        other => CacheError::fetch(key, other),
    }
}
