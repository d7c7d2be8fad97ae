//! Scope resolution for address and participant lookups.
//!
//! | Scope             | Answered from cache when                      | Remote fetch for            |
//! |-------------------|-----------------------------------------------|-----------------------------|
//! | LOCAL_ONLY        | always                                        | never                       |
//! | GLOBAL_ONLY       | every address has a fresh global entry        | addresses without one       |
//! | LOCAL_AND_GLOBAL  | every address has a fresh global entry        | addresses without one       |
//! | LOCAL_THEN_GLOBAL | every address has a local or fresh global one | addresses with neither      |
//!
//! A remote fetch is shared by every caller asking for the same missing
//! addresses while it is in flight. When it completes, the local tier is read
//! again so providers that registered meanwhile are included. Duplicate
//! participant ids are resolved in favour of the local entry, otherwise the
//! first match wins.

use std::collections::HashSet;

use tokio::sync::oneshot;

use capdir_core::{
    DiscoveryEntry, DiscoveryEntryWithMetaInfo, DiscoveryQos, DiscoveryScope,
    GlobalDiscoveryEntry, InterfaceAddress, LookupError, RemoteError,
};

use crate::callback::{deliver, LookupCallback, LookupResult};
use crate::directory::{DirectoryInner, DiscoveryDirectory};
use crate::pending::{PendingKey, Registration, Waiter, WaiterContext};

/// Deduplicate by participant id, keeping the first occurrence.
pub(crate) fn merge_entries(
    entries: impl IntoIterator<Item = DiscoveryEntryWithMetaInfo>,
) -> Vec<DiscoveryEntryWithMetaInfo> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.entry.participant_id.clone()))
        .collect()
}

impl DiscoveryDirectory {
    /// Resolve `interface_name` in each of `domains` and answer `callback`
    /// exactly once.
    pub fn lookup(
        &self,
        domains: &[String],
        interface_name: &str,
        qos: DiscoveryQos,
        callback: Box<dyn LookupCallback>,
    ) {
        let mut seen = HashSet::new();
        let addresses: Vec<InterfaceAddress> = domains
            .iter()
            .map(|d| InterfaceAddress::new(d.clone(), interface_name))
            .filter(|a| seen.insert(a.clone()))
            .collect();

        if addresses.is_empty() {
            callback.on_success(Vec::new());
            return;
        }

        let inner = &self.inner;
        let scope = qos.discovery_scope;
        let mut resolved = Vec::new();
        let mut missing = Vec::new();

        match scope {
            DiscoveryScope::LocalOnly => {
                let local = inner.local_meta(&addresses);
                let result = Ok(inner.finalize(&qos, local));
                deliver(callback, result);
                return;
            }
            DiscoveryScope::GlobalOnly | DiscoveryScope::LocalAndGlobal => {
                for address in &addresses {
                    let fresh = inner.fresh_global(address, &qos);
                    if fresh.is_empty() {
                        missing.push(address.clone());
                    } else {
                        resolved.extend(fresh);
                    }
                }
            }
            DiscoveryScope::LocalThenGlobal => {
                for address in &addresses {
                    let local = inner.local_meta(std::slice::from_ref(address));
                    if !local.is_empty() {
                        resolved.extend(local);
                        continue;
                    }
                    let fresh = inner.fresh_global(address, &qos);
                    if fresh.is_empty() {
                        missing.push(address.clone());
                    } else {
                        resolved.extend(fresh);
                    }
                }
            }
        }

        let context = WaiterContext {
            addresses,
            resolved,
        };

        if missing.is_empty() {
            tracing::debug!(?scope, "lookup answered from cache");
            let entries = inner.resolve(&qos, &context, &[]);
            deliver(callback, Ok(entries));
            return;
        }

        let key = PendingKey::addresses(&missing);
        let reg = inner
            .pending
            .register_pending_lookup(key.clone(), qos.clone(), context, callback);

        if scope == DiscoveryScope::LocalThenGlobal {
            self.answer_if_registered_meanwhile(&key, &reg, &missing);
        }

        if reg.issue_remote {
            let domains: Vec<String> = missing.iter().map(|a| a.domain.clone()).collect();
            self.spawn_remote_lookup(key, reg, qos, domains, interface_name.to_string());
        } else {
            tracing::debug!(waiter = reg.id, "joined in-flight remote lookup");
        }
    }

    /// Resolve a single participant id and answer `callback` exactly once.
    ///
    /// A provider hosted by this process is always answered from the local
    /// tier; the global tier is never consulted for it.
    pub fn lookup_participant(
        &self,
        participant_id: &str,
        qos: DiscoveryQos,
        callback: Box<dyn LookupCallback>,
    ) {
        let inner = &self.inner;
        let scope = qos.discovery_scope;

        if let Some(local) = inner.local_participant(participant_id, scope) {
            deliver(callback, Ok(inner.finalize(&qos, local)));
            return;
        }
        if scope == DiscoveryScope::LocalOnly || inner.is_hosted_locally(participant_id) {
            callback.on_success(Vec::new());
            return;
        }
        if inner.was_removed_locally(participant_id) {
            tracing::debug!(%participant_id, "participant was removed locally");
            callback.on_success(Vec::new());
            return;
        }

        let fresh: Vec<_> = inner
            .global_by_participant
            .lookup(&participant_id.to_string(), qos.cache_max_age)
            .into_iter()
            .map(|g| inner.to_meta(g.entry))
            .collect();
        if !fresh.is_empty() {
            deliver(callback, Ok(inner.finalize(&qos, fresh)));
            return;
        }

        let key = PendingKey::Participant(participant_id.to_string());
        let reg = inner.pending.register_pending_lookup(
            key.clone(),
            qos.clone(),
            WaiterContext::default(),
            callback,
        );
        if reg.issue_remote {
            self.spawn_remote_participant_lookup(key, reg, qos, participant_id.to_string());
        }
    }

    /// `lookup` as a future.
    pub async fn lookup_async(
        &self,
        domains: &[String],
        interface_name: &str,
        qos: DiscoveryQos,
    ) -> LookupResult {
        let (tx, rx) = oneshot::channel::<LookupResult>();
        self.lookup(domains, interface_name, qos, Box::new(tx));
        rx.await.unwrap_or(Err(LookupError::Abandoned))
    }

    /// `lookup_participant` as a future.
    pub async fn lookup_participant_async(
        &self,
        participant_id: &str,
        qos: DiscoveryQos,
    ) -> LookupResult {
        let (tx, rx) = oneshot::channel::<LookupResult>();
        self.lookup_participant(participant_id, qos, Box::new(tx));
        rx.await.unwrap_or(Err(LookupError::Abandoned))
    }

    /// A provider may have registered between the cache check and the
    /// pending registration. If so, answer from the local tier now.
    fn answer_if_registered_meanwhile(
        &self,
        key: &PendingKey,
        reg: &Registration,
        missing: &[InterfaceAddress],
    ) {
        let inner = &self.inner;
        if inner
            .pending
            .is_callback_already_satisfied(key, reg.id, DiscoveryScope::LocalThenGlobal)
        {
            return;
        }
        let late = inner.local_meta(missing);
        if late.is_empty() {
            return;
        }
        if let Some(waiter) = inner.pending.callback_called(key, reg.id) {
            let entries = merge_entries(late.into_iter().chain(waiter.context.resolved));
            let entries = inner.finalize(&waiter.qos, entries);
            waiter.callback.on_success(entries);
        }
    }

    fn spawn_remote_lookup(
        &self,
        key: PendingKey,
        reg: Registration,
        qos: DiscoveryQos,
        domains: Vec<String>,
        interface_name: String,
    ) {
        let inner = self.inner.clone();
        let timeout = inner.timeout_for(&qos);
        tracing::debug!(?domains, %interface_name, "issuing remote lookup");
        self.inner.runtime.spawn(async move {
            let result = inner.remote.lookup(&domains, &interface_name, timeout).await;
            inner.complete(&key, reg.generation, result);
        });
    }

    fn spawn_remote_participant_lookup(
        &self,
        key: PendingKey,
        reg: Registration,
        qos: DiscoveryQos,
        participant_id: String,
    ) {
        let inner = self.inner.clone();
        let timeout = inner.timeout_for(&qos);
        tracing::debug!(%participant_id, "issuing remote participant lookup");
        self.inner.runtime.spawn(async move {
            let result = inner.remote.lookup_participant(&participant_id, timeout).await;
            inner.complete(&key, reg.generation, result);
        });
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

impl DirectoryInner {
    fn timeout_for(&self, qos: &DiscoveryQos) -> std::time::Duration {
        let ms = if qos.discovery_timeout_ms == 0 {
            self.settings.default_discovery_timeout_ms
        } else {
            qos.discovery_timeout_ms
        };
        std::time::Duration::from_millis(ms)
    }

    pub(crate) fn to_meta(&self, entry: DiscoveryEntry) -> DiscoveryEntryWithMetaInfo {
        DiscoveryEntryWithMetaInfo {
            is_local: self.is_hosted_locally(&entry.participant_id),
            entry,
        }
    }

    fn local_meta(&self, addresses: &[InterfaceAddress]) -> Vec<DiscoveryEntryWithMetaInfo> {
        self.search_local(addresses)
            .into_iter()
            .map(DiscoveryEntryWithMetaInfo::local)
            .collect()
    }

    fn fresh_global(
        &self,
        address: &InterfaceAddress,
        qos: &DiscoveryQos,
    ) -> Vec<DiscoveryEntryWithMetaInfo> {
        self.global_by_address
            .lookup(address, qos.cache_max_age)
            .into_iter()
            .filter(|g| !self.was_removed_locally(&g.entry.participant_id))
            .map(|g| self.to_meta(g.entry))
            .collect()
    }

    /// Local participant entry visible under `scope`, if any.
    fn local_participant(
        &self,
        participant_id: &str,
        scope: DiscoveryScope,
    ) -> Option<Vec<DiscoveryEntryWithMetaInfo>> {
        let local: Vec<_> = self
            .local_by_participant
            .lookup_all(&participant_id.to_string())
            .into_iter()
            .filter(|e| scope != DiscoveryScope::GlobalOnly || e.is_global())
            .map(DiscoveryEntryWithMetaInfo::local)
            .collect();
        (!local.is_empty()).then_some(local)
    }

    /// Apply the per-request provider filter.
    fn finalize(
        &self,
        qos: &DiscoveryQos,
        entries: Vec<DiscoveryEntryWithMetaInfo>,
    ) -> Vec<DiscoveryEntryWithMetaInfo> {
        if !qos.provider_must_support_on_change {
            return entries;
        }
        entries
            .into_iter()
            .filter(|e| e.entry.qos.supports_on_change_subscriptions)
            .collect()
    }

    /// Final answer for an address lookup given what the caches held when it
    /// started (`context.resolved`) and what the remote returned.
    fn resolve(
        &self,
        qos: &DiscoveryQos,
        context: &WaiterContext,
        remote: &[DiscoveryEntryWithMetaInfo],
    ) -> Vec<DiscoveryEntryWithMetaInfo> {
        let still_valid = |e: &&DiscoveryEntryWithMetaInfo| {
            !e.is_local || self.is_hosted_locally(&e.entry.participant_id)
        };
        let merged = match qos.discovery_scope {
            DiscoveryScope::LocalOnly => self.local_meta(&context.addresses),
            DiscoveryScope::GlobalOnly => {
                let local = self
                    .local_meta(&context.addresses)
                    .into_iter()
                    .filter(|e| e.entry.is_global());
                merge_entries(
                    local.chain(
                        context
                            .resolved
                            .iter()
                            .chain(remote)
                            .filter(still_valid)
                            .cloned(),
                    ),
                )
            }
            DiscoveryScope::LocalAndGlobal => merge_entries(
                self.local_meta(&context.addresses).into_iter().chain(
                    context
                        .resolved
                        .iter()
                        .chain(remote)
                        .filter(still_valid)
                        .cloned(),
                ),
            ),
            DiscoveryScope::LocalThenGlobal => {
                let mut out = Vec::new();
                for address in &context.addresses {
                    let local = self.local_meta(std::slice::from_ref(address));
                    if !local.is_empty() {
                        out.extend(local);
                        continue;
                    }
                    out.extend(
                        context
                            .resolved
                            .iter()
                            .chain(remote)
                            .filter(|e| !e.is_local)
                            .filter(|e| {
                                e.entry.domain == address.domain
                                    && e.entry.interface_name == address.interface_name
                            })
                            .cloned(),
                    );
                }
                merge_entries(out)
            }
        };
        self.finalize(qos, merged)
    }

    /// Completion of a shared remote call: stage the result, then answer
    /// every caller still waiting on `key`.
    fn complete(
        &self,
        key: &PendingKey,
        generation: u64,
        result: Result<Vec<GlobalDiscoveryEntry>, RemoteError>,
    ) {
        let received = match result {
            Ok(received) => received,
            Err(e) => {
                let waiters = self.pending.finish(key, generation);
                tracing::warn!(error = %e, waiters = waiters.len(), "remote lookup failed");
                for waiter in waiters {
                    waiter.callback.on_error(LookupError::Remote(e.clone()));
                }
                return;
            }
        };

        let received: Vec<GlobalDiscoveryEntry> = received
            .into_iter()
            .filter(|g| g.entry.validate().is_ok())
            .filter(|g| !self.was_removed_locally(&g.entry.participant_id))
            .collect();
        self.register_remote_result(&received);

        let remote: Vec<_> = received
            .into_iter()
            .map(|g| self.to_meta(g.entry))
            .collect();

        let waiters = self.pending.finish(key, generation);
        tracing::debug!(
            received = remote.len(),
            waiters = waiters.len(),
            "remote lookup completed"
        );
        for waiter in waiters {
            let entries = self.answer(&waiter, key, &remote);
            waiter.callback.on_success(entries);
        }
    }

    fn answer(
        &self,
        waiter: &Waiter,
        key: &PendingKey,
        remote: &[DiscoveryEntryWithMetaInfo],
    ) -> Vec<DiscoveryEntryWithMetaInfo> {
        match key {
            PendingKey::Addresses(_) => self.resolve(&waiter.qos, &waiter.context, remote),
            PendingKey::Participant(id) => {
                let scope = waiter.qos.discovery_scope;
                match self.local_participant(id, scope) {
                    Some(local) => self.finalize(&waiter.qos, local),
                    None if self.is_hosted_locally(id) => Vec::new(),
                    None => self.finalize(
                        &waiter.qos,
                        merge_entries(
                            remote
                                .iter()
                                .filter(|e| &e.entry.participant_id == id)
                                .cloned(),
                        ),
                    ),
                }
            }
        }
    }

    /// Remote results go through the same path as pushed updates: router
    /// hop plus global-tier refresh.
    fn register_remote_result(&self, received: &[GlobalDiscoveryEntry]) {
        let _guard = self.lock_mutations();
        for g in received {
            if self.is_hosted_locally(&g.entry.participant_id) {
                continue;
            }
            if let Some(router) = &self.router {
                router.add_next_hop(&g.entry.participant_id, &g.address, g.entry.is_global());
            }
            self.stage_global(g.clone());
        }
    }
}
