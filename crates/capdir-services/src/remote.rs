//! Remote directory client boundary.
//!
//! The backend registry is an injected dependency: the directory never
//! assumes a wire protocol. `InMemoryRemoteDirectory` is a loopback registry
//! for single-node deployments and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

use capdir_core::{GlobalDiscoveryEntry, RemoteError};

#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    /// Every registered entry offering `interface_name` in one of `domains`.
    async fn lookup(
        &self,
        domains: &[String],
        interface_name: &str,
        timeout: Duration,
    ) -> Result<Vec<GlobalDiscoveryEntry>, RemoteError>;

    /// The entry registered under `participant_id`, if any.
    async fn lookup_participant(
        &self,
        participant_id: &str,
        timeout: Duration,
    ) -> Result<Vec<GlobalDiscoveryEntry>, RemoteError>;

    async fn add(&self, entry: GlobalDiscoveryEntry) -> Result<(), RemoteError>;

    async fn remove(&self, participant_ids: &[String]) -> Result<(), RemoteError>;

    /// Keep-alive for providers hosted by this node.
    async fn touch(&self, participant_ids: &[String]) -> Result<(), RemoteError>;

    /// Drop every entry registered under `node_address` that was last seen
    /// before `max_last_seen_ms`: leftovers of an earlier run of that node.
    async fn remove_stale(
        &self,
        node_address: &str,
        max_last_seen_ms: u64,
    ) -> Result<(), RemoteError>;

    /// Transport address under which this node's providers are reachable.
    fn local_address(&self) -> String;
}

// ── In-memory registry ────────────────────────────────────────────────────────

pub struct InMemoryRemoteDirectory {
    address: String,
    entries: DashMap<String, GlobalDiscoveryEntry>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    hold: watch::Sender<bool>,
    lookup_calls: AtomicUsize,
    touch_calls: AtomicUsize,
    remove_stale_calls: AtomicUsize,
    last_touched: Mutex<Vec<String>>,
}

impl InMemoryRemoteDirectory {
    pub fn new(address: impl Into<String>) -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            address: address.into(),
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            hold,
            lookup_calls: AtomicUsize::new(0),
            touch_calls: AtomicUsize::new(0),
            remove_stale_calls: AtomicUsize::new(0),
            last_touched: Mutex::new(Vec::new()),
        }
    }

    /// Register an entry directly, as another node would have.
    pub fn insert(&self, entry: GlobalDiscoveryEntry) {
        self.entries.insert(entry.entry.participant_id.clone(), entry);
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries.contains_key(participant_id)
    }

    pub fn get(&self, participant_id: &str) -> Option<GlobalDiscoveryEntry> {
        self.entries.get(participant_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// While unavailable every call fails with `RemoteError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Park lookups until `release_lookups` is called.
    pub fn hold_lookups(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_lookups(&self) {
        self.hold.send_replace(false);
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn touch_calls(&self) -> usize {
        self.touch_calls.load(Ordering::SeqCst)
    }

    pub fn remove_stale_calls(&self) -> usize {
        self.remove_stale_calls.load(Ordering::SeqCst)
    }

    pub fn last_touched(&self) -> Vec<String> {
        self.last_touched
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable(format!(
                "{} not reachable",
                self.address
            )))
        }
    }

    /// Apply hold and latency, bounded by `timeout`.
    async fn round_trip(&self, timeout: Duration) -> Result<(), RemoteError> {
        let mut hold = self.hold.subscribe();
        let latency = Duration::from_millis(self.latency_ms.load(Ordering::SeqCst));
        let wait = async move {
            let _ = hold.wait_for(|held| !*held).await;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RemoteError::Timeout(timeout))?;
        self.check_available()
    }
}

#[async_trait]
impl RemoteDirectory for InMemoryRemoteDirectory {
    async fn lookup(
        &self,
        domains: &[String],
        interface_name: &str,
        timeout: Duration,
    ) -> Result<Vec<GlobalDiscoveryEntry>, RemoteError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip(timeout).await?;
        let mut found: Vec<GlobalDiscoveryEntry> = self
            .entries
            .iter()
            .filter(|e| {
                e.entry.interface_name == interface_name && domains.contains(&e.entry.domain)
            })
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| a.entry.participant_id.cmp(&b.entry.participant_id));
        Ok(found)
    }

    async fn lookup_participant(
        &self,
        participant_id: &str,
        timeout: Duration,
    ) -> Result<Vec<GlobalDiscoveryEntry>, RemoteError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip(timeout).await?;
        Ok(self.get(participant_id).into_iter().collect())
    }

    async fn add(&self, entry: GlobalDiscoveryEntry) -> Result<(), RemoteError> {
        self.check_available()?;
        self.insert(entry);
        Ok(())
    }

    async fn remove(&self, participant_ids: &[String]) -> Result<(), RemoteError> {
        self.check_available()?;
        for id in participant_ids {
            self.entries.remove(id);
        }
        Ok(())
    }

    async fn touch(&self, participant_ids: &[String]) -> Result<(), RemoteError> {
        self.touch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if let Ok(mut last) = self.last_touched.lock() {
            *last = participant_ids.to_vec();
        }
        Ok(())
    }

    async fn remove_stale(
        &self,
        node_address: &str,
        max_last_seen_ms: u64,
    ) -> Result<(), RemoteError> {
        self.remove_stale_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.entries.retain(|_, g| {
            g.address != node_address || g.entry.last_seen_date_ms >= max_last_seen_ms
        });
        Ok(())
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }
}
