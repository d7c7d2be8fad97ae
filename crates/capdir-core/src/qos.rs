//! Consumer-side discovery policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time the remote directory gets to answer a lookup.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 40_000;

/// Which tiers of the cache (and the remote registry) a lookup consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryScope {
    /// Providers hosted by this process only. Never goes remote.
    LocalOnly,
    /// Globally registered providers only.
    GlobalOnly,
    /// Local providers where present, global ones for everything else.
    #[default]
    LocalThenGlobal,
    /// Union of local and global providers.
    LocalAndGlobal,
}

/// Freshness requirement for cached global entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMaxAge {
    /// Any cached entry is acceptable, however old.
    #[default]
    Unbounded,
    /// Entries inserted more than this many ms ago are ignored.
    /// `Millis(0)` bypasses the cache entirely.
    Millis(u64),
}

impl CacheMaxAge {
    pub fn from_duration(d: Duration) -> Self {
        CacheMaxAge::Millis(d.as_millis().min(u64::MAX as u128) as u64)
    }

    /// Whether an entry of the given age satisfies the requirement.
    pub fn admits(&self, age_ms: u64) -> bool {
        match *self {
            CacheMaxAge::Unbounded => true,
            CacheMaxAge::Millis(0) => false,
            CacheMaxAge::Millis(max) => age_ms <= max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryQos {
    pub discovery_scope: DiscoveryScope,
    pub cache_max_age: CacheMaxAge,
    /// Upper bound for the remote round trip.
    pub discovery_timeout_ms: u64,
    /// Only return providers that support on-change subscriptions.
    pub provider_must_support_on_change: bool,
}

impl Default for DiscoveryQos {
    fn default() -> Self {
        Self {
            discovery_scope: DiscoveryScope::default(),
            cache_max_age: CacheMaxAge::default(),
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            provider_must_support_on_change: false,
        }
    }
}

impl DiscoveryQos {
    pub fn with_scope(scope: DiscoveryScope) -> Self {
        Self {
            discovery_scope: scope,
            ..Self::default()
        }
    }

    pub fn cache_max_age(mut self, max_age: CacheMaxAge) -> Self {
        self.cache_max_age = max_age;
        self
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}
