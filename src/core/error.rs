use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Fetch failed for query '{key}': {message}")]
    Fetch { key: String, message: String },

    #[error("Mutation on '{entity_type}' failed: {message}")]
    Mutation { entity_type: String, message: String },

    #[error("Conflict on '{entity_type}': {message}")]
    Conflict {
        entity_type: String,
        message: String,
        canonical: Option<JsonValue>,
    },

    #[error("Mutation already in flight")]
    MutationInFlight,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid payload for '{entity_type}': {message}")]
    InvalidPayload { entity_type: String, message: String },

    #[error("Field '{field}' is not registered on '{entity_type}'")]
    UnknownField { entity_type: String, field: String },

    #[error("Entity '{entity_type}:{id}' not found")]
    EntityNotFound { entity_type: String, id: String },

    #[error("Entity '{entity_type}:{id}' is already live")]
    EntityExists { entity_type: String, id: String },

    #[error("Entity type '{0}' is registered with a different model")]
    TypeMismatch(String),

    #[error("Entity '{0}' has no update mutation declared")]
    NoUpdateMutation(String),

    #[error("Query binding '{0}' was disposed")]
    Disposed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl CacheError {
    pub fn fetch(key: impl ToString, message: impl ToString) -> Self {
        Self::Fetch {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub fn mutation(entity_type: impl ToString, message: impl ToString) -> Self {
        Self::Mutation {
            entity_type: entity_type.to_string(),
            message: message.to_string(),
        }
    }

    pub fn conflict(
        entity_type: impl ToString,
        message: impl ToString,
        canonical: Option<JsonValue>,
    ) -> Self {
        Self::Conflict {
            entity_type: entity_type.to_string(),
            message: message.to_string(),
            canonical,
        }
    }

    pub fn invalid_payload(entity_type: impl ToString, message: impl ToString) -> Self {
        Self::InvalidPayload {
            entity_type: entity_type.to_string(),
            message: message.to_string(),
        }
    }

    /// True for failures reported by a mutation call (including conflicts).
    pub fn is_mutation_failure(&self) -> bool {
        matches!(self, Self::Mutation { .. } | Self::Conflict { .. })
    }

    /// Server-provided canonical value carried by a conflict, if any.
    pub fn canonical(&self) -> Option<&JsonValue> {
        match self {
            Self::Conflict { canonical, .. } => canonical.as_ref(),
            _ => None,
        }
    }

    /// Re-labels any failure coming back from a mutation call as a
    /// `Mutation` error for `entity_type`, leaving conflicts intact.
    pub(crate) fn into_mutation_failure(self, entity_type: &str) -> Self {
        match self {
            err @ (Self::Mutation { .. } | Self::Conflict { .. }) => err,
            other => Self::mutation(entity_type, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl<T> From<std::sync::PoisonError<T>> for CacheError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
