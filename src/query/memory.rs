use super::cache::{
    InvalidateFilter, ListenerId, MutationCall, QueryCache, QueryFetcher, QueryListener,
    as_fetch_error,
};
use super::config::QueryCacheConfig;
use crate::core::{JsonValue, QueryKey, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{Level, event};

struct CacheObserver {
    entity_type: String,
    fetcher: QueryFetcher,
    listener: QueryListener,
}

#[derive(Default)]
struct CacheEntry {
    data: Option<JsonValue>,
    fetched_at: Option<Instant>,
    stale: bool,
    observers: BTreeMap<ListenerId, CacheObserver>,
}

impl CacheEntry {
    fn is_expired(&self, stale_time: Duration) -> bool {
        self.stale
            || self
                .fetched_at
                .is_none_or(|fetched_at| fetched_at.elapsed() >= stale_time)
    }

    /// Unobserved and unable to serve a fresh hit.
    fn is_dead(&self, stale_time: Duration) -> bool {
        self.observers.is_empty() && self.is_expired(stale_time)
    }
}

/// Call counters of the in-memory cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub fetch_calls: u64,
    pub fetch_hits: u64,
    pub mutation_calls: u64,
    pub invalidations: u64,
}

/// Process-local [`QueryCache`]: keeps the last payload per key, honours
/// the configured stale time and retries.
///
/// Retention: an entry lives while it has observers or fresh data. The last
/// observer leaving drops an expired entry; [`InMemoryQueryCache::prune`]
/// drops entries that expired after their observers left.
pub struct InMemoryQueryCache {
    config: QueryCacheConfig,
    entries: Mutex<HashMap<QueryKey, CacheEntry>>,
    next_listener: AtomicU64,
    fetch_calls: AtomicU64,
    fetch_hits: AtomicU64,
    mutation_calls: AtomicU64,
    invalidations: AtomicU64,
}

impl Default for InMemoryQueryCache {
    fn default() -> Self {
        Self::from_valid_config(QueryCacheConfig::default())
    }
}

impl InMemoryQueryCache {
    pub fn new(config: QueryCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    /// Shared handle ready to pass to bindings.
    pub fn shared(config: QueryCacheConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(config)?))
    }

    fn from_valid_config(config: QueryCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            fetch_calls: AtomicU64::new(0),
            fetch_hits: AtomicU64::new(0),
            mutation_calls: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_data(&self, key: &QueryKey) -> Option<JsonValue> {
        let entries = self.entries();
        let entry = entries.get(key)?;
        if entry.is_expired(self.config.stale_time) {
            return None;
        }
        entry.data.clone()
    }

    /// Last payload stored for `key`, fresh or not.
    pub fn cached(&self, key: &QueryKey) -> Option<JsonValue> {
        self.entries().get(key).and_then(|entry| entry.data.clone())
    }

    /// Seeds or overwrites the payload for `key`.
    pub fn set_query_data(&self, key: &QueryKey, data: JsonValue) {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_default();
        entry.data = Some(data);
        entry.fetched_at = Some(Instant::now());
        entry.stale = false;
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries()
            .get(key)
            .map(|entry| entry.stale)
            .unwrap_or(false)
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.entries()
            .get(key)
            .map(|entry| entry.observers.len())
            .unwrap_or(0)
    }

    /// Number of keys with a stored entry.
    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    /// Drops every unobserved expired entry. Returns how many went.
    pub fn prune(&self) -> usize {
        let stale_time = self.config.stale_time;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_dead(stale_time));
        let pruned = before - entries.len();
        if pruned > 0 {
            event!(Level::DEBUG, pruned, "pruned unobserved cache entries");
        }
        pruned
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            fetch_calls: self.fetch_calls.load(Ordering::SeqCst),
            fetch_hits: self.fetch_hits.load(Ordering::SeqCst),
            mutation_calls: self.mutation_calls.load(Ordering::SeqCst),
            invalidations: self.invalidations.load(Ordering::SeqCst),
        }
    }

    async fn fetch_with_retries(&self, key: &QueryKey, fetcher: &QueryFetcher) -> Result<JsonValue> {
        let mut attempt = 0;
        loop {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            match fetcher(key.clone()).await {
                Ok(data) => return Ok(data),
                Err(err) if attempt < self.config.fetch_retries => {
                    attempt += 1;
                    event!(Level::DEBUG, query_key = %key, attempt, error = %err, "retrying fetch");
                    sleep(self.config.retry_delay).await;
                }
                Err(err) => return Err(as_fetch_error(key, err)),
            }
        }
    }
}

#[async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn fetch(&self, key: &QueryKey, fetcher: QueryFetcher) -> Result<JsonValue> {
        if let Some(data) = self.fresh_data(key) {
            self.fetch_hits.fetch_add(1, Ordering::SeqCst);
            return Ok(data);
        }

        let data = self.fetch_with_retries(key, &fetcher).await?;
        self.set_query_data(key, data.clone());
        Ok(data)
    }

    fn subscribe(
        &self,
        key: &QueryKey,
        entity_type: &str,
        fetcher: QueryFetcher,
        listener: QueryListener,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.entries().entry(key.clone()).or_default().observers.insert(
            id,
            CacheObserver {
                entity_type: entity_type.to_string(),
                fetcher,
                listener,
            },
        );
        id
    }

    fn unsubscribe(&self, key: &QueryKey, listener: ListenerId) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.observers.remove(&listener);
        if entry.is_dead(self.config.stale_time) {
            entries.remove(key);
            event!(Level::DEBUG, query_key = %key, "dropped unobserved cache entry");
        }
    }

    async fn invalidate(&self, filter: InvalidateFilter) -> Vec<QueryKey> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);

        let mut matched = Vec::new();
        let mut refetch = Vec::new();
        {
            let mut entries = self.entries();
            for (key, entry) in entries.iter_mut() {
                if !filter.matches(key) {
                    continue;
                }
                entry.stale = true;
                matched.push(key.clone());
                if let Some(observer) = entry.observers.values().next() {
                    refetch.push((key.clone(), Arc::clone(&observer.fetcher)));
                }
            }
        }
        matched.sort();

        for (key, fetcher) in refetch {
            let outcome = self.fetch(&key, fetcher).await;
            if let Err(err) = &outcome {
                log::warn!("refetch of {} after invalidation failed: {}", key, err);
            }

            let listeners: Vec<QueryListener> = self
                .entries()
                .get(&key)
                .map(|entry| {
                    entry
                        .observers
                        .values()
                        .map(|observer| Arc::clone(&observer.listener))
                        .collect()
                })
                .unwrap_or_default();
            for listener in listeners {
                listener(&key, &outcome);
            }
        }

        matched
    }

    fn active_keys_for_entity_type(&self, entity_type: &str) -> BTreeSet<QueryKey> {
        self.entries()
            .iter()
            .filter(|(_, entry)| {
                entry
                    .observers
                    .values()
                    .any(|observer| observer.entity_type == entity_type)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn active_keys(&self) -> BTreeSet<QueryKey> {
        self.entries()
            .iter()
            .filter(|(_, entry)| !entry.observers.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn execute_mutation(&self, call: MutationCall) -> Result<JsonValue> {
        let mut attempt = 0;
        loop {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            match call().await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.config.mutation_retries => {
                    attempt += 1;
                    event!(Level::DEBUG, attempt, error = %err, "retrying mutation call");
                    sleep(self.config.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
