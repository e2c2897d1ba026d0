//! Client configuration loaded from TOML.
//!
//! ```toml
//! environment = "development"
//! cleanup_interval_ms = 30000
//!
//! [profiles.REALTIME]
//! stale_time_ms = 1000
//! ```

use crate::error::Result;
use crate::manager::DEFAULT_CACHE_TIME_MS;
use crate::profile::{CacheProfile, Environment, ProfileOverride, ProfileTable, StrategyName};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// Default period of the eviction sweep.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;

/// Default identity field for list merges.
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Active environment
    pub environment: Environment,
    /// Eviction sweep period, `0` for manual cleanup
    pub cleanup_interval_ms: u64,
    /// Retention for entries written without a TTL
    pub default_cache_time_ms: u64,
    /// Field that identifies list elements
    pub identity_field: String,
    /// Per-profile overrides for the active environment
    #[serde(deserialize_with = "deserialize_profiles")]
    pub profiles: HashMap<StrategyName, ProfileOverride>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            default_cache_time_ms: DEFAULT_CACHE_TIME_MS,
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            profiles: HashMap::new(),
        }
    }
}

impl QueryConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        tracing::debug!(environment = %config.environment, "loaded query config");
        Ok(config)
    }

    /// Default configuration for `environment`.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            environment,
            ..Self::default()
        }
    }

    /// Set the environment.
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the cleanup sweep period.
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval_ms: u64) -> Self {
        self.cleanup_interval_ms = interval_ms;
        self
    }

    /// Override one profile.
    #[must_use]
    pub fn with_profile_override(mut self, name: StrategyName, o: ProfileOverride) -> Self {
        self.profiles.insert(name, o);
        self
    }

    /// Profiles resolved for the active environment.
    #[must_use]
    pub fn profile_table(&self) -> ProfileTable {
        ProfileTable::with_overrides(self.environment, &self.profiles)
    }

    /// Resolve a single profile.
    #[must_use]
    pub fn profile(&self, name: StrategyName) -> CacheProfile {
        self.profile_table().resolve(name)
    }
}

fn deserialize_profiles<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<StrategyName, ProfileOverride>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, ProfileOverride>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, o)| {
            name.parse::<StrategyName>()
                .map(|name| (name, o))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    #[test]
    fn test_defaults() {
        let config = QueryConfig::default();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.cleanup_interval_ms, 60_000);
        assert_eq!(config.default_cache_time_ms, 300_000);
        assert_eq!(config.identity_field, "id");
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(QueryConfig::from_toml_str("").unwrap(), QueryConfig::default());
    }

    #[test]
    fn test_from_toml_str() {
        let config = QueryConfig::from_toml_str(
            r#"
            environment = "development"
            cleanup_interval_ms = 0
            identity_field = "uuid"

            [profiles.REALTIME]
            stale_time_ms = 1000

            [profiles.CRITICAL]
            refetch_interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.cleanup_interval_ms, 0);
        assert_eq!(config.identity_field, "uuid");

        let realtime = config.profile(StrategyName::Realtime);
        assert_eq!(realtime.stale_time_ms, 1_000);
        assert_eq!(realtime.cache_time_ms, 60_000);

        let critical = config.profile(StrategyName::Critical);
        assert_eq!(critical.refetch_interval_ms, Some(500));
        assert_eq!(critical.stale_time_ms, 2_000);
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let err = QueryConfig::from_toml_str("[profiles.SOMETIMES]\nstale_time_ms = 1").unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_unknown_environment_rejected() {
        let err = QueryConfig::from_toml_str(r#"environment = "staging""#).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_test_environment_disables_caching() {
        let config = QueryConfig::for_environment(Environment::Test).with_profile_override(
            StrategyName::Static,
            ProfileOverride {
                stale_time_ms: Some(10),
                ..ProfileOverride::default()
            },
        );
        assert_eq!(config.profile(StrategyName::Static), CacheProfile::default());
    }

    #[test]
    fn test_builders() {
        let config = QueryConfig::default()
            .with_environment(Environment::Development)
            .with_cleanup_interval(1_000);
        assert_eq!(config.profile_table().environment(), Environment::Development);
        assert_eq!(config.cleanup_interval_ms, 1_000);
    }
}
