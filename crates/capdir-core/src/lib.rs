//! capdir-core: data model, error taxonomy, clock and configuration for the
//! node-local discovery directory. No async code lives here.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod qos;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CapdirConfig, DirectorySettings, PersistenceSettings};
pub use entry::{
    CustomParameter, DiscoveryEntry, DiscoveryEntryWithMetaInfo, GlobalDiscoveryEntry,
    InterfaceAddress, ProviderQos, ProviderScope, Version,
};
pub use error::{EntryError, LookupError, PersistenceError, RemoteError};
pub use qos::{CacheMaxAge, DiscoveryQos, DiscoveryScope};
