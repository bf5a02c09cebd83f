pub mod error;
pub mod key;

pub use error::{CacheError, Result};
pub use key::{EntityKey, QueryKey};

/// Raw server-shaped payload value.
pub type JsonValue = serde_json::Value;
