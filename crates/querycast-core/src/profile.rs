//! Named cache strategy profiles.
//!
//! A profile says how long data stays fresh (`stale_time_ms`), how long it
//! may sit unused before eviction (`cache_time_ms`) and whether it is
//! polled in the background (`refetch_interval_ms`). Values depend on the
//! [`Environment`]; the `test` environment resolves everything to zero so
//! caching is effectively disabled.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Short windows for fast iteration
    Development,
    /// Full-length windows
    #[default]
    Production,
    /// Caching disabled
    Test,
}

impl Environment {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            _ => Err(CacheError::UnknownEnvironment(s.to_string())),
        }
    }
}

/// Name of a built-in cache profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyName {
    /// Live data kept current by realtime pushes
    Realtime,
    /// User-authored content
    UserContent,
    /// Rarely changing reference data
    Static,
    /// Short-lived data that is also polled
    Critical,
}

impl StrategyName {
    /// Every built-in profile name.
    pub const ALL: [Self; 4] = [Self::Realtime, Self::UserContent, Self::Static, Self::Critical];

    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "REALTIME",
            Self::UserContent => "USER_CONTENT",
            Self::Static => "STATIC",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyName {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == normalized)
            .ok_or_else(|| CacheError::UnknownProfile(s.to_string()))
    }
}

/// Resolved timing for one profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheProfile {
    /// Age after which data is refetched on read
    pub stale_time_ms: u64,
    /// Idle time after which the entry is evicted
    pub cache_time_ms: u64,
    /// Background polling period
    pub refetch_interval_ms: Option<u64>,
}

impl CacheProfile {
    /// Profile with the given windows and no polling.
    #[must_use]
    pub const fn new(stale_time_ms: u64, cache_time_ms: u64) -> Self {
        Self {
            stale_time_ms,
            cache_time_ms,
            refetch_interval_ms: None,
        }
    }

    /// Enable background polling.
    #[must_use]
    pub const fn with_refetch_interval(mut self, interval_ms: u64) -> Self {
        self.refetch_interval_ms = Some(interval_ms);
        self
    }

    /// Built-in values for `name` under `env`.
    #[must_use]
    pub const fn builtin(name: StrategyName, env: Environment) -> Self {
        match (env, name) {
            (Environment::Test, _) => Self::new(0, 0),

            (Environment::Production, StrategyName::Realtime) => Self::new(30 * SECOND, 5 * MINUTE),
            (Environment::Production, StrategyName::UserContent) => {
                Self::new(2 * MINUTE, 10 * MINUTE)
            }
            (Environment::Production, StrategyName::Static) => Self::new(HOUR, 24 * HOUR),
            (Environment::Production, StrategyName::Critical) => {
                Self::new(10 * SECOND, MINUTE).with_refetch_interval(30 * SECOND)
            }

            (Environment::Development, StrategyName::Realtime) => Self::new(5 * SECOND, MINUTE),
            (Environment::Development, StrategyName::UserContent) => {
                Self::new(10 * SECOND, MINUTE)
            }
            (Environment::Development, StrategyName::Static) => Self::new(MINUTE, 5 * MINUTE),
            (Environment::Development, StrategyName::Critical) => {
                Self::new(2 * SECOND, 30 * SECOND).with_refetch_interval(10 * SECOND)
            }
        }
    }
}

/// Partial profile layered over a built-in one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverride {
    /// Replacement stale time
    pub stale_time_ms: Option<u64>,
    /// Replacement cache time
    pub cache_time_ms: Option<u64>,
    /// Replacement polling period
    pub refetch_interval_ms: Option<u64>,
}

impl ProfileOverride {
    /// Apply the fields that are set.
    #[must_use]
    pub fn apply(&self, base: CacheProfile) -> CacheProfile {
        CacheProfile {
            stale_time_ms: self.stale_time_ms.unwrap_or(base.stale_time_ms),
            cache_time_ms: self.cache_time_ms.unwrap_or(base.cache_time_ms),
            refetch_interval_ms: self.refetch_interval_ms.or(base.refetch_interval_ms),
        }
    }
}

/// Profiles resolved for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileTable {
    environment: Environment,
    profiles: HashMap<StrategyName, CacheProfile>,
}

impl ProfileTable {
    /// Built-in profiles for `env`.
    #[must_use]
    pub fn for_environment(env: Environment) -> Self {
        Self::with_overrides(env, &HashMap::new())
    }

    /// Built-in profiles for `env` with `overrides` applied.
    ///
    /// Overrides are ignored in the `test` environment.
    #[must_use]
    pub fn with_overrides(
        env: Environment,
        overrides: &HashMap<StrategyName, ProfileOverride>,
    ) -> Self {
        let profiles = StrategyName::ALL
            .into_iter()
            .map(|name| {
                let base = CacheProfile::builtin(name, env);
                let profile = match overrides.get(&name) {
                    Some(o) if env != Environment::Test => o.apply(base),
                    _ => base,
                };
                (name, profile)
            })
            .collect();

        Self {
            environment: env,
            profiles,
        }
    }

    /// Environment the table was resolved for.
    #[must_use]
    pub const fn environment(&self) -> Environment {
        self.environment
    }

    /// Profile for `name`.
    #[must_use]
    pub fn resolve(&self, name: StrategyName) -> CacheProfile {
        self.profiles
            .get(&name)
            .copied()
            .unwrap_or_else(|| CacheProfile::builtin(name, self.environment))
    }

    /// Profile by its string name, e.g. `"CRITICAL"`.
    pub fn resolve_str(&self, name: &str) -> Result<CacheProfile, CacheError> {
        Ok(self.resolve(name.parse()?))
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}
