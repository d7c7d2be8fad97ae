//! Provider registration records.
//!
//! A `DiscoveryEntry` describes one concrete provider instance, addressed
//! either by its `InterfaceAddress` (domain + interface name) or directly by
//! its participant id. Entries are plain values: every read out of the
//! directory hands back a copy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EntryError;

// ── Provider QoS ──────────────────────────────────────────────────────────────

/// Semantic version of the interface a provider implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Visibility of a provider registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderScope {
    /// Only consumers inside this process can discover the provider.
    Local,
    /// The provider is published to the backend registry.
    #[default]
    Global,
}

/// Free-form key/value attached to a provider's QoS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderQos {
    pub priority: i64,
    pub scope: ProviderScope,
    pub supports_on_change_subscriptions: bool,
    pub custom_parameters: Vec<CustomParameter>,
}

impl Default for ProviderQos {
    fn default() -> Self {
        Self {
            priority: 0,
            scope: ProviderScope::Global,
            supports_on_change_subscriptions: false,
            custom_parameters: Vec::new(),
        }
    }
}

// ── Addressing ────────────────────────────────────────────────────────────────

/// `(domain, interface_name)`: the key for address-based lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub domain: String,
    pub interface_name: String,
}

impl InterfaceAddress {
    pub fn new(domain: impl Into<String>, interface_name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            interface_name: interface_name.into(),
        }
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.interface_name)
    }
}

// ── Entries ───────────────────────────────────────────────────────────────────

/// A provider registration record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub provider_version: Version,
    pub domain: String,
    pub interface_name: String,
    /// Unique per provider instance. Unique within the local tier.
    pub participant_id: String,
    pub qos: ProviderQos,
    /// Wall-clock ms at which the provider was last known to be alive.
    pub last_seen_date_ms: u64,
    /// Absolute wall-clock ms after which the entry must be purged.
    pub expiry_date_ms: u64,
    /// Opaque credential reference. Never interpreted here.
    #[serde(default)]
    pub public_key_id: String,
}

impl DiscoveryEntry {
    /// Minimal entry with default QoS (global scope) that never expires.
    pub fn new(
        domain: impl Into<String>,
        interface_name: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_version: Version::default(),
            domain: domain.into(),
            interface_name: interface_name.into(),
            participant_id: participant_id.into(),
            qos: ProviderQos::default(),
            last_seen_date_ms: 0,
            expiry_date_ms: u64::MAX,
            public_key_id: String::new(),
        }
    }

    pub fn with_scope(mut self, scope: ProviderScope) -> Self {
        self.qos.scope = scope;
        self
    }

    pub fn with_expiry(mut self, expiry_date_ms: u64) -> Self {
        self.expiry_date_ms = expiry_date_ms;
        self
    }

    pub fn is_global(&self) -> bool {
        self.qos.scope == ProviderScope::Global
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        InterfaceAddress::new(self.domain.clone(), self.interface_name.clone())
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiry_date_ms <= now_ms
    }

    /// Reject entries that could never be looked up.
    pub fn validate(&self) -> Result<(), EntryError> {
        if self.participant_id.is_empty() {
            return Err(EntryError::EmptyParticipantId);
        }
        if self.domain.is_empty() {
            return Err(EntryError::EmptyDomain {
                participant_id: self.participant_id.clone(),
            });
        }
        if self.interface_name.is_empty() {
            return Err(EntryError::EmptyInterfaceName {
                participant_id: self.participant_id.clone(),
            });
        }
        Ok(())
    }
}

/// An entry as known to the backend registry, with the transport address
/// of the node hosting the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalDiscoveryEntry {
    #[serde(flatten)]
    pub entry: DiscoveryEntry,
    pub address: String,
}

impl GlobalDiscoveryEntry {
    pub fn new(entry: DiscoveryEntry, address: impl Into<String>) -> Self {
        Self {
            entry,
            address: address.into(),
        }
    }
}

/// Lookup result element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntryWithMetaInfo {
    /// True when the provider is hosted by this process.
    pub is_local: bool,
    #[serde(flatten)]
    pub entry: DiscoveryEntry,
}

impl DiscoveryEntryWithMetaInfo {
    pub fn local(entry: DiscoveryEntry) -> Self {
        Self {
            is_local: true,
            entry,
        }
    }

    pub fn remote(entry: DiscoveryEntry) -> Self {
        Self {
            is_local: false,
            entry,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.entry.participant_id
    }
}
