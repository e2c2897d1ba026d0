//! Query orchestration errors.

use querycast_core::CacheError;
use std::fmt::Display;
use thiserror::Error;

/// Error surfaced by queries, mutations and infinite queries.
///
/// `Clone` so one single-flight result can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Fetcher or mutation function failed
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Fetched data could not be converted to or from JSON
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cache layer error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Cache entry was removed while the request was in flight
    #[error("Query invalidated while loading: {0}")]
    Invalidated(String),

    /// Background task could not be spawned
    #[error("Spawn failed: {0}")]
    Spawn(String),
}

impl QueryError {
    /// Fetch failure from any displayable error.
    pub fn fetch(err: impl Display) -> Self {
        Self::Fetch(err.to_string())
    }

    /// Whether the error came from the fetcher itself.
    #[must_use]
    pub const fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<CacheError> for QueryError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Serialization(e) => Self::Serialization(e.to_string()),
            other => Self::Cache(other.to_string()),
        }
    }
}

impl From<futures::task::SpawnError> for QueryError {
    fn from(err: futures::task::SpawnError) -> Self {
        Self::Spawn(err.to_string())
    }
}

/// Result type for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;
