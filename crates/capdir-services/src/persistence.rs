//! Snapshot persistence for the local tier.
//!
//! The snapshot is a JSON document holding every local entry plus the
//! participant ids registered globally. The id list is informational: on
//! load an entry's own scope decides whether it is staged globally. Loading is best-effort: a missing,
//! unreadable or corrupt file is logged and the directory starts empty.
//! Writes go to a temp file that is then renamed over the target.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use capdir_core::{DiscoveryEntry, GlobalDiscoveryEntry, PersistenceError};

use crate::directory::{DirectoryInner, DiscoveryDirectory};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    local_entries: Vec<DiscoveryEntry>,
    #[serde(default)]
    global_registrations: Vec<String>,
}

impl DiscoveryDirectory {
    /// Write the local tier to `path`.
    pub fn save_local_capabilities_to_file(&self, path: &Path) -> Result<(), PersistenceError> {
        self.inner.save_to(path)
    }

    /// Write the local tier to the configured snapshot path, if any.
    pub fn flush_persisted_file(&self) -> Result<(), PersistenceError> {
        match &self.inner.persist_path {
            Some(path) => self.inner.save_to(path),
            None => Ok(()),
        }
    }

    /// Restore local entries from a snapshot. Global-scope entries are also
    /// staged in the global tier. Returns how many entries were loaded.
    pub fn load_persisted_file(&self, path: &Path) -> usize {
        let snapshot: Snapshot = match read_json(path) {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %path.display(), "no persisted capabilities");
                return 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring persisted capabilities");
                return 0;
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                version = snapshot.version,
                path = %path.display(),
                "unsupported snapshot version"
            );
            return 0;
        }

        let listed_global: HashSet<String> = snapshot.global_registrations.into_iter().collect();
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let local_address = inner.remote.local_address();
        let _guard = inner.lock_mutations();
        let mut loaded = 0usize;
        for entry in snapshot.local_entries {
            if entry.validate().is_err() || entry.is_expired(now) {
                continue;
            }
            let id = entry.participant_id.clone();
            if inner.is_hosted_locally(&id) {
                continue;
            }
            inner
                .local_by_address
                .insert_at(entry.interface_address(), entry.clone(), now);
            inner
                .local_by_participant
                .insert_at(id.clone(), entry.clone(), now);
            if entry.is_global() {
                inner.stage_global(GlobalDiscoveryEntry::new(entry, local_address.clone()));
            } else if listed_global.contains(&id) {
                tracing::debug!(participant_id = %id, "local-scope entry listed as global, not staged");
            }
            loaded += 1;
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted capabilities");
        }
        loaded
    }

    /// Seed the global tier from a static provisioning file (a JSON array
    /// of global entries). Returns how many entries were injected.
    pub fn inject_global_capabilities_from_file(&self, path: &Path) -> usize {
        let entries: Vec<GlobalDiscoveryEntry> = match read_json(path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring provisioned global capabilities");
                return 0;
            }
        };
        let injected = self.register_received_capabilities(
            entries.into_iter().map(|g| (g.address, g.entry)),
        );
        tracing::info!(count = injected, path = %path.display(), "injected global capabilities");
        injected
    }

    /// Rewrite the configured snapshot in the background. Failures are logged.
    pub(crate) fn schedule_persist(&self) {
        if self.inner.persist_path.is_none() {
            return;
        }
        let inner = self.inner.clone();
        self.inner.runtime.spawn_blocking(move || {
            if let Some(path) = &inner.persist_path {
                if let Err(e) = inner.save_to(path) {
                    tracing::warn!(error = %e, "failed to persist local capabilities");
                }
            }
        });
    }
}

impl DirectoryInner {
    fn save_to(&self, path: &Path) -> Result<(), PersistenceError> {
        let _guard = self
            .persist_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut local_entries = self.local_by_participant.values();
        local_entries.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        let global_registrations = local_entries
            .iter()
            .filter(|e| e.is_global())
            .map(|e| e.participant_id.clone())
            .collect();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            local_entries,
            global_registrations,
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(PersistenceError::Serialize)?;
        write_atomic(path, json.as_bytes())?;
        tracing::trace!(path = %path.display(), "local capabilities persisted");
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let text =
        fs::read_to_string(path).map_err(|e| PersistenceError::Read(path.to_path_buf(), e))?;
    serde_json::from_str(&text).map_err(|e| PersistenceError::Parse(path.to_path_buf(), e))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let write_err = |e: std::io::Error| PersistenceError::Write(path.to_path_buf(), e);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path).map_err(write_err)?;
        file.write_all(data).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
    }
    fs::rename(&tmp_path, path).map_err(write_err)
}
