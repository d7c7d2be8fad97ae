//! Periodic maintenance: expiry sweep and freshness keep-alive, plus the
//! one-shot startup cleanup of this node's stale backend entries.
//!
//! Each runs as its own task with its own stop signal. A task never overlaps
//! its own next tick, and the tasks never share state beyond the caches.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use capdir_core::{DiscoveryEntry, GlobalDiscoveryEntry, RemoteError};

use crate::directory::{DirectoryInner, DiscoveryDirectory};

/// Stale-entry cleanup is retried until this long after startup.
const REMOVE_STALE_RETRY_WINDOW_MS: u64 = 3_600_000;
const REMOVE_STALE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What one expiry sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    /// Global entries older than the configured cache age.
    pub stale_global: usize,
    /// Global entries past their expiry date.
    pub expired_global: usize,
    /// Local entries past their expiry date.
    pub expired_local: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.stale_global + self.expired_global + self.expired_local
    }
}

impl DiscoveryDirectory {
    /// One expiry sweep.
    pub fn purge_expired_discovery_entries(&self) -> PurgeReport {
        let inner = &self.inner;
        let mut report = PurgeReport {
            stale_global: self.clean_cache(inner.settings.cache_max_age()),
            ..PurgeReport::default()
        };
        let now = inner.clock.now_ms();

        {
            let _guard = inner.lock_mutations();

            let expired_global: Vec<String> = inner
                .global_by_participant
                .values()
                .into_iter()
                .filter(|g| {
                    g.entry.is_expired(now) && !inner.is_hosted_locally(&g.entry.participant_id)
                })
                .map(|g| g.entry.participant_id)
                .collect();
            for id in &expired_global {
                inner.drop_global(id);
                if let Some(router) = &inner.router {
                    router.remove_next_hop(id);
                }
            }
            report.expired_global = expired_global.len();

            let expired_local: Vec<String> = inner
                .local_by_participant
                .values()
                .into_iter()
                .filter(|e| e.is_expired(now))
                .map(|e| e.participant_id)
                .collect();
            for id in &expired_local {
                report.expired_local += inner.remove_locked(id, false).local_removed;
            }

            let forgotten = inner.clear_removals();
            if forgotten > 0 {
                tracing::trace!(forgotten, "local removal markers cleared");
            }
        }

        if report.total() > 0 {
            tracing::info!(
                stale_global = report.stale_global,
                expired_global = report.expired_global,
                expired_local = report.expired_local,
                "expired discovery entries purged"
            );
        }
        if report.expired_local > 0 {
            self.schedule_persist();
        }
        report
    }

    /// Refresh every local global-scope entry and tell the backend they are
    /// still alive. Failures are logged; the next tick retries.
    /// Returns how many entries were refreshed.
    pub async fn send_freshness_update(&self) -> usize {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let expiry = now.saturating_add(inner.settings.default_expiry_interval_ms);

        let refreshed = {
            let _guard = inner.lock_mutations();
            inner.refresh_local_globals(now, |_| expiry)
        };
        if refreshed.is_empty() {
            return 0;
        }
        self.schedule_persist();

        let ids: Vec<String> = refreshed.into_iter().map(|g| g.entry.participant_id).collect();
        match inner.remote.touch(&ids).await {
            Ok(()) => tracing::debug!(count = ids.len(), "freshness update sent"),
            Err(e) => tracing::warn!(error = %e, count = ids.len(), "freshness update failed"),
        }
        ids.len()
    }

    /// Re-publish every local global-scope provider, e.g. after the backend
    /// lost its state. Expiry dates are extended to at least the default
    /// expiry interval from now, never shortened. Returns how many providers
    /// were queued.
    pub fn trigger_global_provider_reregistration(&self) -> usize {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let expiry = now.saturating_add(inner.settings.default_expiry_interval_ms);

        let count = {
            let _guard = inner.lock_mutations();
            let refreshed = inner.refresh_local_globals(now, |old| old.expiry_date_ms.max(expiry));
            let count = refreshed.len();
            for entry in refreshed {
                inner.publisher.add(entry);
            }
            count
        };

        tracing::info!(count, "global providers queued for re-registration");
        if count > 0 {
            self.schedule_persist();
        }
        count
    }

    /// Ask the backend to drop entries this node registered before it
    /// started. One attempt.
    pub async fn remove_stale_providers(&self) -> Result<(), RemoteError> {
        let inner = &self.inner;
        let node_address = inner.remote.local_address();
        inner
            .remote
            .remove_stale(&node_address, inner.started_at_ms)
            .await?;
        tracing::info!(
            %node_address,
            started_at_ms = inner.started_at_ms,
            "stale backend entries removed"
        );
        Ok(())
    }

    /// Spawn the expiry and freshness loops and the stale-entry cleanup.
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        let settings = self.settings();
        let (expiry_stop, expiry_rx) = oneshot::channel();
        let (freshness_stop, freshness_rx) = oneshot::channel();
        let (stale_stop, stale_rx) = oneshot::channel();

        let expiry = self.inner.runtime.spawn(expiry_loop(
            self.clone(),
            settings.purge_expired_interval(),
            expiry_rx,
        ));
        let freshness = self.inner.runtime.spawn(freshness_loop(
            self.clone(),
            settings.freshness_update_interval(),
            freshness_rx,
        ));

        let stale = self.inner.runtime.spawn(remove_stale_task(
            self.clone(),
            REMOVE_STALE_RETRY_DELAY,
            stale_rx,
        ));

        MaintenanceHandle {
            tasks: vec![
                (expiry_stop, expiry),
                (freshness_stop, freshness),
                (stale_stop, stale),
            ],
        }
    }
}

impl DirectoryInner {
    /// Re-stamp every local global-scope entry as last seen at `now`, with
    /// the expiry date `expiry_for` picks, and re-stage it in the global
    /// tier. Caller holds the mutation lock. Returns the refreshed entries.
    fn refresh_local_globals(
        &self,
        now: u64,
        expiry_for: impl Fn(&DiscoveryEntry) -> u64,
    ) -> Vec<GlobalDiscoveryEntry> {
        let local_address = self.remote.local_address();
        let globals: Vec<DiscoveryEntry> = self
            .local_by_participant
            .values()
            .into_iter()
            .filter(DiscoveryEntry::is_global)
            .collect();

        let mut refreshed = Vec::with_capacity(globals.len());
        for old in &globals {
            let mut fresh = old.clone();
            fresh.last_seen_date_ms = now;
            fresh.expiry_date_ms = expiry_for(old);

            self.local_by_address
                .remove_where(&old.interface_address(), |e| {
                    e.participant_id == old.participant_id
                });
            self.local_by_participant.remove_all(&old.participant_id);
            self.local_by_address
                .insert_at(fresh.interface_address(), fresh.clone(), now);
            self.local_by_participant
                .insert_at(fresh.participant_id.clone(), fresh.clone(), now);

            let staged = GlobalDiscoveryEntry::new(fresh, local_address.clone());
            self.stage_global(staged.clone());
            refreshed.push(staged);
        }
        refreshed
    }
}

/// Stops the maintenance loops. Dropping the handle also stops them, without
/// waiting for them to exit.
pub struct MaintenanceHandle {
    tasks: Vec<(oneshot::Sender<()>, JoinHandle<anyhow::Result<()>>)>,
}

impl MaintenanceHandle {
    /// Signal both loops and wait for them to exit.
    pub async fn shutdown(self) {
        for (stop, task) in self.tasks {
            let _ = stop.send(());
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "maintenance task failed"),
                Err(e) => tracing::warn!(error = %e, "maintenance task panicked"),
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Purge expired entries every `period`.
pub async fn expiry_loop(
    directory: DiscoveryDirectory,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = &mut stop => {
                tracing::debug!("expiry loop shutting down");
                return Ok(());
            }
            _ = interval.tick() => {
                directory.purge_expired_discovery_entries();
            }
        }
    }
}

/// Remove this node's stale backend entries, retrying every `retry_delay`
/// until it succeeds or the retry window since startup has passed.
pub async fn remove_stale_task(
    directory: DiscoveryDirectory,
    retry_delay: Duration,
    mut stop: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let inner = &directory.inner;
    loop {
        let e = match directory.remove_stale_providers().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let elapsed_ms = inner.clock.now_ms().saturating_sub(inner.started_at_ms);
        if elapsed_ms > REMOVE_STALE_RETRY_WINDOW_MS {
            tracing::error!(
                error = %e,
                elapsed_ms,
                "stale backend entries not removed, giving up"
            );
            return Ok(());
        }
        tracing::warn!(error = %e, "stale backend entry removal failed, retrying");

        tokio::select! {
            _ = &mut stop => {
                tracing::debug!("stale removal shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

/// Re-announce local global providers every `period`.
pub async fn freshness_loop(
    directory: DiscoveryDirectory,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = &mut stop => {
                tracing::debug!("freshness loop shutting down");
                return Ok(());
            }
            _ = interval.tick() => {
                directory.send_freshness_update().await;
            }
        }
    }
}
