//! Discovery directory, the node-local registry of provider entries.
//!
//! Owns two cache tiers, each indexed twice:
//! - local (providers hosted by this process), by address and by participant
//! - global (providers learned from the backend), by address and by participant
//!
//! Local entries are authoritative and never time-limited. Global entries
//! carry their insertion time and are evicted by the expiry sweep. Every
//! read hands back copies.
//!
//! Lookups live in `lookup.rs`, snapshot I/O in `persistence.rs` and the
//! periodic tasks in `maintenance.rs`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use capdir_core::{
    CapdirConfig, Clock, DirectorySettings, DiscoveryEntry, DiscoveryEntryWithMetaInfo,
    EntryError, GlobalDiscoveryEntry, InterfaceAddress, PersistenceSettings, SystemClock,
};

use crate::cache::ExpiringMultiCache;
use crate::observer::{ObserverList, ProviderRegistrationObserver};
use crate::pending::PendingLookups;
use crate::publisher::Publisher;
use crate::remote::RemoteDirectory;
use crate::router::MessageRouter;

/// Handle to the directory. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DiscoveryDirectory {
    pub(crate) inner: Arc<DirectoryInner>,
}

pub(crate) struct DirectoryInner {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: DirectorySettings,
    pub(crate) persist_path: Option<PathBuf>,
    pub(crate) remote: Arc<dyn RemoteDirectory>,
    pub(crate) router: Option<Arc<dyn MessageRouter>>,
    pub(crate) runtime: tokio::runtime::Handle,
    /// Ordered queue of backend registrations and removals.
    pub(crate) publisher: Publisher,
    /// Clock reading at build time. Backend entries of this node last seen
    /// before it belong to an earlier run.
    pub(crate) started_at_ms: u64,

    pub(crate) local_by_address: ExpiringMultiCache<InterfaceAddress, DiscoveryEntry>,
    pub(crate) local_by_participant: ExpiringMultiCache<String, DiscoveryEntry>,
    pub(crate) global_by_address: ExpiringMultiCache<InterfaceAddress, GlobalDiscoveryEntry>,
    pub(crate) global_by_participant: ExpiringMultiCache<String, GlobalDiscoveryEntry>,

    pub(crate) pending: PendingLookups,
    pub(crate) observers: ObserverList,

    /// Serializes add/remove so observers see same-participant events in call order.
    mutation_lock: Mutex<()>,
    /// Participant ids removed locally, with the removal time. Cleared by the sweep.
    removed_locally: Mutex<HashMap<String, u64>>,
    /// Serializes snapshot writes.
    pub(crate) persist_lock: Mutex<()>,
}

// ── Construction ──────────────────────────────────────────────────────────────

pub struct DirectoryBuilder {
    remote: Arc<dyn RemoteDirectory>,
    clock: Arc<dyn Clock>,
    router: Option<Arc<dyn MessageRouter>>,
    settings: DirectorySettings,
    persistence: PersistenceSettings,
}

impl DirectoryBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn router(mut self, router: Arc<dyn MessageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn settings(mut self, settings: DirectorySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime; remote calls and snapshot
    /// writes are spawned onto the runtime current at build time.
    pub fn build(self) -> DiscoveryDirectory {
        let clock = self.clock;
        let runtime = tokio::runtime::Handle::current();
        let publisher = Publisher::start(self.remote.clone(), &runtime);
        DiscoveryDirectory {
            inner: Arc::new(DirectoryInner {
                local_by_address: ExpiringMultiCache::new(clock.clone()),
                local_by_participant: ExpiringMultiCache::new(clock.clone()),
                global_by_address: ExpiringMultiCache::new(clock.clone()),
                global_by_participant: ExpiringMultiCache::new(clock.clone()),
                started_at_ms: clock.now_ms(),
                clock,
                settings: self.settings,
                persist_path: self.persistence.snapshot_path(),
                remote: self.remote,
                router: self.router,
                runtime,
                publisher,
                pending: PendingLookups::new(),
                observers: ObserverList::default(),
                mutation_lock: Mutex::new(()),
                removed_locally: Mutex::new(HashMap::new()),
                persist_lock: Mutex::new(()),
            }),
        }
    }
}

impl DiscoveryDirectory {
    pub fn builder(remote: Arc<dyn RemoteDirectory>) -> DirectoryBuilder {
        DirectoryBuilder {
            remote,
            clock: Arc::new(SystemClock),
            router: None,
            settings: DirectorySettings::default(),
            persistence: PersistenceSettings::disabled(),
        }
    }

    /// Build from loaded configuration, then warm the caches from the
    /// persisted snapshot and the provisioning file, if configured.
    pub fn from_config(
        config: &CapdirConfig,
        remote: Arc<dyn RemoteDirectory>,
        router: Option<Arc<dyn MessageRouter>>,
    ) -> Self {
        let mut builder = Self::builder(remote)
            .settings(config.directory.clone())
            .persistence(config.persistence.clone());
        if let Some(router) = router {
            builder = builder.router(router);
        }
        let directory = builder.build();

        if let Some(path) = config.persistence.snapshot_path() {
            directory.load_persisted_file(&path);
        }
        if let Some(path) = config.persistence.provisioning_path() {
            directory.inject_global_capabilities_from_file(&path);
        }
        directory
    }

    pub fn settings(&self) -> &DirectorySettings {
        &self.inner.settings
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

impl DiscoveryDirectory {
    /// Register a provider hosted by this process.
    ///
    /// A global entry is also staged in the global tier, so this node's own
    /// lookups see it before the backend round trip completes, and is
    /// published to the remote directory in the background. Re-adding a
    /// participant id replaces its previous entry.
    pub fn add(&self, entry: DiscoveryEntry) -> Result<(), EntryError> {
        entry.validate()?;
        let inner = &self.inner;
        let address = entry.interface_address();

        {
            let _guard = inner.lock_mutations();
            let now = inner.clock.now_ms();

            let previous = inner.local_by_participant.remove_all(&entry.participant_id);
            for old in &previous {
                inner.local_by_address.remove(&old.interface_address(), old);
            }
            inner
                .local_by_address
                .insert_at(address.clone(), entry.clone(), now);
            inner
                .local_by_participant
                .insert_at(entry.participant_id.clone(), entry.clone(), now);

            if entry.is_global() {
                let staged = GlobalDiscoveryEntry::new(entry.clone(), inner.remote.local_address());
                inner.stage_global(staged.clone());
                inner.publisher.add(stamped(staged, now));
            } else if previous.iter().any(DiscoveryEntry::is_global) {
                inner.drop_global(&entry.participant_id);
                inner.publisher.remove(vec![entry.participant_id.clone()]);
            }

            inner.forget_removal(&entry.participant_id);
            inner.observers.notify_add(&entry);
        }

        tracing::info!(
            participant_id = %entry.participant_id,
            %address,
            global = entry.is_global(),
            "provider registered"
        );

        let local: Vec<_> = inner
            .local_by_address
            .lookup_all(&address)
            .into_iter()
            .map(DiscoveryEntryWithMetaInfo::local)
            .collect();
        inner.pending.call_pending_lookups(&address, &local);
        self.schedule_persist();
        Ok(())
    }

    /// Unregister a provider. Unknown ids are a no-op.
    pub fn remove(&self, participant_id: &str) {
        self.remove_entries(&[participant_id.to_string()]);
    }

    /// Unregister a batch of providers under one lock, so observers see the
    /// whole batch without interleaved mutations.
    pub fn remove_entries(&self, participant_ids: &[String]) {
        let inner = &self.inner;
        let mut local_removed = 0;
        {
            let _guard = inner.lock_mutations();
            let mut unpublish = Vec::new();
            for id in participant_ids {
                let outcome = inner.remove_locked(id, true);
                if outcome.local_removed > 0 {
                    local_removed += outcome.local_removed;
                    tracing::info!(participant_id = %id, "provider unregistered");
                }
                if outcome.was_global {
                    unpublish.push(id.clone());
                }
            }
            inner.publisher.remove(unpublish);
        }

        if local_removed > 0 {
            self.schedule_persist();
        }
    }

    /// Merge backend-announced entries into the global tier, each keyed by
    /// the transport address (channel) it is reachable under.
    pub fn register_received_capabilities(
        &self,
        entries: impl IntoIterator<Item = (String, DiscoveryEntry)>,
    ) -> usize {
        let inner = &self.inner;
        let _guard = inner.lock_mutations();
        let mut registered = 0;
        for (address, entry) in entries {
            if entry.validate().is_err() || inner.was_removed_locally(&entry.participant_id) {
                continue;
            }
            if let Some(router) = &inner.router {
                router.add_next_hop(&entry.participant_id, &address, entry.is_global());
            }
            inner.stage_global(GlobalDiscoveryEntry::new(entry, address));
            registered += 1;
        }
        tracing::debug!(count = registered, "received capabilities registered");
        registered
    }

    /// Backend-announced removals. Local entries are left alone.
    pub fn remove_received_capabilities(&self, participant_ids: &[String]) {
        let inner = &self.inner;
        let _guard = inner.lock_mutations();
        for id in participant_ids {
            if !inner.drop_global(id).is_empty() {
                if let Some(router) = &inner.router {
                    router.remove_next_hop(id);
                }
                tracing::debug!(participant_id = %id, "global entry removed by backend");
            }
        }
    }

    pub fn add_provider_registration_observer(
        &self,
        observer: Arc<dyn ProviderRegistrationObserver>,
    ) {
        self.inner.observers.add(observer);
    }

    pub fn remove_provider_registration_observer(
        &self,
        observer: &Arc<dyn ProviderRegistrationObserver>,
    ) -> bool {
        self.inner.observers.remove(observer)
    }
}

// ── Cache reads ───────────────────────────────────────────────────────────────

impl DiscoveryDirectory {
    /// Local entries for the given addresses. Never does I/O.
    pub fn get_cached_local_capabilities(
        &self,
        addresses: &[InterfaceAddress],
    ) -> Vec<DiscoveryEntry> {
        self.inner.search_local(addresses)
    }

    pub fn get_cached_local_capabilities_by_participant(
        &self,
        participant_id: &str,
    ) -> Vec<DiscoveryEntry> {
        self.inner
            .local_by_participant
            .lookup_all(&participant_id.to_string())
    }

    pub fn get_cached_global_discovery_entries(&self) -> Vec<GlobalDiscoveryEntry> {
        let mut entries = self.inner.global_by_participant.values();
        entries.sort_by(|a, b| a.entry.participant_id.cmp(&b.entry.participant_id));
        entries
    }

    pub fn count_global_capabilities(&self) -> usize {
        self.inner.global_by_participant.len()
    }

    pub fn count_local_capabilities(&self) -> usize {
        self.inner.local_by_participant.len()
    }

    /// Evict global entries older than `max_age`. Local entries are never
    /// touched. Returns how many global entries were dropped.
    pub fn clean_cache(&self, max_age: Duration) -> usize {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let removed = inner.global_by_participant.cleanup_at(max_age, now);
        inner.global_by_address.cleanup_at(max_age, now);
        if removed > 0 {
            tracing::debug!(removed, "stale global entries evicted");
        }
        removed
    }

    pub fn has_pending_lookups(&self) -> bool {
        self.inner.pending.has_pending_lookups()
    }

    /// Drop every entry and fail every waiting lookup. Nothing is persisted.
    pub fn clear(&self) {
        let inner = &self.inner;
        {
            let _guard = inner.lock_mutations();
            inner.local_by_address.clear();
            inner.local_by_participant.clear();
            inner.global_by_address.clear();
            inner.global_by_participant.clear();
            inner.removed_locally_map().clear();
        }
        let abandoned = inner.pending.abandon_all();
        if abandoned > 0 {
            tracing::info!(abandoned, "pending lookups abandoned on clear");
        }
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RemoveOutcome {
    pub local_removed: usize,
    pub was_global: bool,
}

impl DirectoryInner {
    pub(crate) fn lock_mutations(&self) -> MutexGuard<'_, ()> {
        self.mutation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn removed_locally_map(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.removed_locally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn was_removed_locally(&self, participant_id: &str) -> bool {
        self.removed_locally_map().contains_key(participant_id)
    }

    fn forget_removal(&self, participant_id: &str) {
        self.removed_locally_map().remove(participant_id);
    }

    pub(crate) fn clear_removals(&self) -> usize {
        let mut map = self.removed_locally_map();
        let count = map.len();
        map.clear();
        count
    }

    pub(crate) fn search_local(&self, addresses: &[InterfaceAddress]) -> Vec<DiscoveryEntry> {
        addresses
            .iter()
            .flat_map(|a| self.local_by_address.lookup_all(a))
            .collect()
    }

    pub(crate) fn is_hosted_locally(&self, participant_id: &str) -> bool {
        !self
            .local_by_participant
            .lookup_all(&participant_id.to_string())
            .is_empty()
    }

    /// Insert or refresh a global entry. Any previous entry for the same
    /// participant is replaced and the insertion time is reset.
    pub(crate) fn stage_global(&self, entry: GlobalDiscoveryEntry) {
        let now = self.clock.now_ms();
        self.drop_global(&entry.entry.participant_id);
        self.global_by_address
            .insert_at(entry.entry.interface_address(), entry.clone(), now);
        self.global_by_participant
            .insert_at(entry.entry.participant_id.clone(), entry, now);
    }

    /// Remove a participant from both global indexes.
    pub(crate) fn drop_global(&self, participant_id: &str) -> Vec<GlobalDiscoveryEntry> {
        let removed = self
            .global_by_participant
            .remove_all(&participant_id.to_string());
        for old in &removed {
            self.global_by_address
                .remove(&old.entry.interface_address(), old);
        }
        removed
    }

    /// Remove a participant from all four caches. Caller holds the
    /// mutation lock. `remember` marks the id as removed locally.
    pub(crate) fn remove_locked(&self, participant_id: &str, remember: bool) -> RemoveOutcome {
        let local = self
            .local_by_participant
            .remove_all(&participant_id.to_string());
        for old in &local {
            self.local_by_address.remove(&old.interface_address(), old);
        }
        let global = self.drop_global(participant_id);

        if !global.is_empty() {
            if let Some(router) = &self.router {
                router.remove_next_hop(participant_id);
            }
        }
        if !local.is_empty() && remember {
            self.removed_locally_map()
                .insert(participant_id.to_string(), self.clock.now_ms());
        }
        for old in &local {
            self.observers.notify_remove(old);
        }
        RemoveOutcome {
            local_removed: local.len(),
            was_global: local.iter().any(DiscoveryEntry::is_global),
        }
    }
}

/// Backend copy of a local registration, last seen no earlier than `now`.
pub(crate) fn stamped(mut entry: GlobalDiscoveryEntry, now: u64) -> GlobalDiscoveryEntry {
    entry.entry.last_seen_date_ms = entry.entry.last_seen_date_ms.max(now);
    entry
}
