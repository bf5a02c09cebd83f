use super::cache::{QueryFetcher, fetcher};
use crate::core::{JsonValue, QueryKey, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Extracts the record(s) from an envelope payload.
pub type Select = Arc<dyn Fn(&JsonValue) -> Result<JsonValue> + Send + Sync>;

/// What a query binding fetches and how to read the payload.
#[derive(Clone)]
pub struct QueryOptions {
    pub key: QueryKey,
    pub fetcher: QueryFetcher,
    pub select: Option<Select>,
}

impl QueryOptions {
    pub fn new(key: impl Into<QueryKey>, fetcher: QueryFetcher) -> Self {
        Self {
            key: key.into(),
            fetcher,
            select: None,
        }
    }

    /// Options with the fetcher built from an async closure.
    pub fn from_fn<F, Fut>(key: impl Into<QueryKey>, fetch: F) -> Self
    where
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue>> + Send + 'static,
    {
        Self::new(key, fetcher(fetch))
    }

    /// Set the payload selector
    pub fn select(
        mut self,
        select: impl Fn(&JsonValue) -> Result<JsonValue> + Send + Sync + 'static,
    ) -> Self {
        self.select = Some(Arc::new(select));
        self
    }

    /// Selector reading one top-level property of an object payload.
    pub fn select_field(self, field: &str) -> Self {
        let field = field.to_string();
        self.select(move |payload| Ok(payload.get(&field).cloned().unwrap_or(JsonValue::Null)))
    }

    pub(crate) fn extract(&self, payload: &JsonValue) -> Result<JsonValue> {
        match &self.select {
            Some(select) => select(payload),
            None => Ok(payload.clone()),
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("select", &self.select.is_some())
            .finish()
    }
}
