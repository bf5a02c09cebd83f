use crate::core::CacheError;
use std::fmt;

/// Coarse phase of a query binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Never fetched.
    #[default]
    Idle,
    /// First fetch in flight, nothing to show yet.
    Pending,
    /// Data hydrated at least once.
    Ready,
    /// The last fetch failed.
    Failed,
}

impl QueryStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, QueryStatus::Ready | QueryStatus::Failed)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Ready => write!(f, "ready"),
            QueryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Reactive value a binding exposes to the UI layer.
#[derive(Debug, Clone)]
pub enum QueryState<T> {
    Idle,
    Pending,
    Ready(T),
    Failed(CacheError),
}

impl<T> QueryState<T> {
    pub fn status(&self) -> QueryStatus {
        match self {
            QueryState::Idle => QueryStatus::Idle,
            QueryState::Pending => QueryStatus::Pending,
            QueryState::Ready(_) => QueryStatus::Ready,
            QueryState::Failed(_) => QueryStatus::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, QueryState::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, QueryState::Pending)
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            QueryState::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_ready(self) -> Option<T> {
        match self {
            QueryState::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            QueryState::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryState<U> {
        match self {
            QueryState::Idle => QueryState::Idle,
            QueryState::Pending => QueryState::Pending,
            QueryState::Ready(value) => QueryState::Ready(f(value)),
            QueryState::Failed(err) => QueryState::Failed(err),
        }
    }
}
