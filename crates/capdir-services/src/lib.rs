//! capdir-services: the discovery directory and its collaborators.
//!
//! `DiscoveryDirectory` is the only type application code needs: it owns the
//! cache tiers, coordinates remote lookups and runs the maintenance loops.
//! The remote directory client, message router and registration observers
//! are injected through the traits re-exported here.

pub mod cache;
pub mod callback;
pub mod directory;
pub mod lookup;
pub mod maintenance;
pub mod observer;
pub mod pending;
pub mod persistence;
mod publisher;
pub mod remote;
pub mod router;

pub use cache::ExpiringMultiCache;
pub use callback::{from_fns, FnCallback, LookupCallback, LookupResult};
pub use directory::{DirectoryBuilder, DiscoveryDirectory};
pub use maintenance::{MaintenanceHandle, PurgeReport};
pub use observer::ProviderRegistrationObserver;
pub use pending::{PendingKey, PendingLookups};
pub use remote::{InMemoryRemoteDirectory, RemoteDirectory};
pub use router::MessageRouter;
