//! Pending-lookup coordinator.
//!
//! Tracks callers waiting on an in-flight remote lookup so that concurrent
//! requests for the same key share one remote call and one result.
//!
//! Per key: `NoPending → Pending (≥1 waiter, remote call issued) → NoPending`.
//! There is no retry state here; the coordinator only deduplicates.
//!
//! Callbacks are never invoked while the coordinator's lock is held.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use capdir_core::{
    DiscoveryEntryWithMetaInfo, DiscoveryQos, DiscoveryScope, InterfaceAddress, LookupError,
};

use crate::callback::LookupCallback;
use crate::lookup::merge_entries;

pub type WaiterId = u64;

/// What a remote lookup was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingKey {
    /// The addresses that had to be fetched remotely.
    Addresses(BTreeSet<InterfaceAddress>),
    Participant(String),
}

impl PendingKey {
    pub fn addresses<'a>(addresses: impl IntoIterator<Item = &'a InterfaceAddress>) -> Self {
        PendingKey::Addresses(addresses.into_iter().cloned().collect())
    }

    fn contains(&self, address: &InterfaceAddress) -> bool {
        matches!(self, PendingKey::Addresses(set) if set.contains(address))
    }
}

/// Per-caller state carried while waiting.
#[derive(Debug, Clone, Default)]
pub struct WaiterContext {
    /// Every address the caller asked for.
    pub addresses: Vec<InterfaceAddress>,
    /// Entries already resolved from the caches before going remote.
    pub resolved: Vec<DiscoveryEntryWithMetaInfo>,
}

pub struct Waiter {
    pub id: WaiterId,
    pub qos: DiscoveryQos,
    pub context: WaiterContext,
    pub callback: Box<dyn LookupCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: WaiterId,
    /// Identifies the pending entry the waiter joined.
    pub generation: u64,
    /// True when this caller created the entry and must issue the remote call.
    pub issue_remote: bool,
}

struct PendingEntry {
    generation: u64,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
pub struct PendingLookups {
    entries: Mutex<HashMap<PendingKey, PendingEntry>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl PendingLookups {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PendingKey, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a callback on `key`. Only the first caller for a key is told to
    /// issue the remote call; later callers join it.
    pub fn register_pending_lookup(
        &self,
        key: PendingKey,
        qos: DiscoveryQos,
        context: WaiterContext,
        callback: Box<dyn LookupCallback>,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.lock();
        let issue_remote = !map.contains_key(&key);
        let entry = map.entry(key).or_insert_with(|| PendingEntry {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            waiters: Vec::new(),
        });
        entry.waiters.push(Waiter {
            id,
            qos,
            context,
            callback,
        });
        tracing::debug!(waiter = id, issue_remote, "pending lookup registered");
        Registration {
            id,
            generation: entry.generation,
            issue_remote,
        }
    }

    /// Whether waiter `id` has already been answered by someone else.
    ///
    /// Only LOCAL_THEN_GLOBAL waiters can be answered early, by a provider
    /// registering locally while the remote call is in flight.
    pub fn is_callback_already_satisfied(
        &self,
        key: &PendingKey,
        id: WaiterId,
        scope: DiscoveryScope,
    ) -> bool {
        if scope != DiscoveryScope::LocalThenGlobal {
            return false;
        }
        match self.lock().get(key) {
            Some(entry) => !entry.waiters.iter().any(|w| w.id == id),
            None => true,
        }
    }

    /// Take waiter `id` off `key`. The key is dropped once it has no waiters.
    pub fn callback_called(&self, key: &PendingKey, id: WaiterId) -> Option<Waiter> {
        let mut map = self.lock();
        let entry = map.get_mut(key)?;
        let idx = entry.waiters.iter().position(|w| w.id == id)?;
        let waiter = entry.waiters.remove(idx);
        if entry.waiters.is_empty() {
            map.remove(key);
        }
        Some(waiter)
    }

    /// Answer LOCAL_THEN_GLOBAL waiters on any key containing `address`
    /// with the local entries just registered for it. Returns how many
    /// callers were answered.
    pub fn call_pending_lookups(
        &self,
        address: &InterfaceAddress,
        local_entries: &[DiscoveryEntryWithMetaInfo],
    ) -> usize {
        if local_entries.is_empty() {
            return 0;
        }
        let ready: Vec<Waiter> = {
            let mut map = self.lock();
            let mut ready = Vec::new();
            map.retain(|key, entry| {
                if !key.contains(address) {
                    return true;
                }
                let (hit, keep): (Vec<_>, Vec<_>) = entry
                    .waiters
                    .drain(..)
                    .partition(|w| w.qos.discovery_scope == DiscoveryScope::LocalThenGlobal);
                ready.extend(hit);
                entry.waiters = keep;
                !entry.waiters.is_empty()
            });
            ready
        };

        let answered = ready.len();
        for waiter in ready {
            let mut entries =
                merge_entries(local_entries.iter().cloned().chain(waiter.context.resolved));
            if waiter.qos.provider_must_support_on_change {
                entries.retain(|e| e.entry.qos.supports_on_change_subscriptions);
            }
            tracing::debug!(waiter = waiter.id, %address, "pending lookup satisfied locally");
            waiter.callback.on_success(entries);
        }
        answered
    }

    /// Close the entry for `key` after its remote call completed, returning
    /// the callers still waiting. An entry from a newer generation is left
    /// alone.
    pub fn finish(&self, key: &PendingKey, generation: u64) -> Vec<Waiter> {
        let mut map = self.lock();
        match map.get(key) {
            Some(entry) if entry.generation == generation => map
                .remove(key)
                .map(|entry| entry.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn has_pending_lookups(&self) -> bool {
        self.lock().values().any(|entry| !entry.waiters.is_empty())
    }

    /// Fail every waiting caller.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<Waiter> = self
            .lock()
            .drain()
            .flat_map(|(_, entry)| entry.waiters)
            .collect();
        let count = drained.len();
        for waiter in drained {
            waiter.callback.on_error(LookupError::Abandoned);
        }
        count
    }
}
