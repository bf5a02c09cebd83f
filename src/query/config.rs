use crate::core::{CacheError, Result};
use std::time::Duration;

const MAX_RETRIES: u32 = 10;

/// In-memory query cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheConfig {
    /// How long fetched data counts as fresh (zero: always refetch)
    pub stale_time: Duration,

    /// Extra attempts for a failing fetch
    pub fetch_retries: u32,

    /// Extra attempts for a failing mutation call
    pub mutation_retries: u32,

    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCacheConfig {
    pub fn new() -> Self {
        Self {
            stale_time: Duration::ZERO,
            fetch_retries: 0,
            mutation_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    /// Set stale time
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set fetch retries
    pub fn fetch_retries(mut self, retries: u32) -> Self {
        self.fetch_retries = retries;
        self
    }

    /// Set mutation retries
    pub fn mutation_retries(mut self, retries: u32) -> Self {
        self.mutation_retries = retries;
        self
    }

    /// Set retry delay
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.fetch_retries > MAX_RETRIES {
            return Err(CacheError::Config(format!(
                "fetch_retries must be <= {}",
                MAX_RETRIES
            )));
        }
        if self.mutation_retries > MAX_RETRIES {
            return Err(CacheError::Config(format!(
                "mutation_retries must be <= {}",
                MAX_RETRIES
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = QueryCacheConfig::new()
            .stale_time(Duration::from_secs(30))
            .fetch_retries(2)
            .retry_delay(Duration::from_millis(5));
        assert_eq!(config.stale_time, Duration::from_secs(30));
        assert_eq!(config.fetch_retries, 2);
        assert_eq!(config.mutation_retries, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_bounds() {
        assert!(QueryCacheConfig::new().mutation_retries(11).validate().is_err());
        assert!(QueryCacheConfig::new().fetch_retries(11).validate().is_err());
    }
}
