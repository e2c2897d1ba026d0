//! Error types for the cache layer.

use thiserror::Error;

/// Main error type for cache, configuration and merge operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Value could not be converted to or from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration document could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Update strategy name is not one of the known strategies
    #[error("Unknown update strategy: {0}")]
    UnknownStrategy(String),

    /// Cache profile name is not one of the known profiles
    #[error("Unknown cache profile: {0}")]
    UnknownProfile(String),

    /// Environment name is not one of the known environments
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    /// Realtime message could not be merged into the cached value
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// Caller-supplied routine failed
    #[error("{0}")]
    General(String),
}

/// Merge errors raised by update strategies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Existing value or payload has a shape the strategy cannot work with
    #[error("cannot {strategy}: expected {expected}, found {found}")]
    Shape {
        /// Strategy that was applied
        strategy: &'static str,
        /// Shape the strategy requires
        expected: &'static str,
        /// Shape that was found
        found: &'static str,
    },

    /// Identity-keyed operation without an identity value
    #[error("cannot {strategy}: message carries no `{field}` identity")]
    MissingIdentity {
        /// Strategy that was applied
        strategy: &'static str,
        /// Identity field that was looked up
        field: String,
    },
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_error_display() {
        let err = MergeError::Shape {
            strategy: "append",
            expected: "array",
            found: "object",
        };
        assert_eq!(err.to_string(), "cannot append: expected array, found object");
    }

    #[test]
    fn test_cache_error_from_merge() {
        let err: CacheError = MergeError::MissingIdentity {
            strategy: "remove",
            field: "id".to_string(),
        }
        .into();
        assert!(matches!(err, CacheError::Merge(_)));
        assert!(err.to_string().contains("`id`"));
    }

    #[test]
    fn test_cache_error_from_json() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(err.to_string().starts_with("Serialization error"));
    }
}
