use crate::core::{CacheError, Result};

/// When unreferenced entities leave the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict as soon as the last query key or mutation hold lets go.
    #[default]
    Immediate,
    /// Keep unreferenced entities until `collect_garbage` runs.
    Deferred,
}

/// Entity manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityManagerConfig {
    /// Eviction timing for unreferenced entities
    pub eviction: EvictionPolicy,

    /// Prefix for temporary string ids of optimistic creates
    pub provisional_prefix: String,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManagerConfig {
    pub fn new() -> Self {
        Self {
            eviction: EvictionPolicy::Immediate,
            provisional_prefix: "tmp-".to_string(),
        }
    }

    /// Set the eviction policy
    pub fn eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Set the provisional id prefix
    pub fn provisional_prefix(mut self, prefix: &str) -> Self {
        self.provisional_prefix = prefix.to_string();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.provisional_prefix.is_empty() {
            return Err(CacheError::Config(
                "provisional_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EntityManagerConfig::default();
        assert_eq!(config.eviction, EvictionPolicy::Immediate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let config = EntityManagerConfig::new()
            .eviction(EvictionPolicy::Deferred)
            .provisional_prefix("");
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }
}
