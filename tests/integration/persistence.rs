use crate::*;
use std::path::Path;

use anyhow::{Context, Result};

use capdir_core::{
    CapdirConfig, CustomParameter, DiscoveryQos, DiscoveryScope, InterfaceAddress, ProviderScope,
    Version,
};

// ══════════════════════════════════════════════════════════════════════════════
//  Snapshot persistence and provisioning: warm starts from disk
// ══════════════════════════════════════════════════════════════════════════════

fn config_in(dir: &std::path::Path) -> CapdirConfig {
    let mut config = CapdirConfig::default();
    config.persistence.enabled = true;
    config.persistence.local_capabilities_file = dir.join("LocalCapabilitiesDirectory.persist");
    config
}

type Started = (DiscoveryDirectory, Arc<InMemoryRemoteDirectory>, Arc<HopRecorder>);

fn start(config: &CapdirConfig) -> Started {
    init_tracing();
    let remote = Arc::new(InMemoryRemoteDirectory::new(LOCAL_NODE));
    let router = Arc::new(HopRecorder::default());
    let dir = DiscoveryDirectory::from_config(
        config,
        remote.clone(),
        Some(router.clone() as Arc<dyn MessageRouter>),
    );
    (dir, remote, router)
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not JSON", path.display()))
}

fn write_provisioning(path: &Path, entries: &[GlobalDiscoveryEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(entries)?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn rich_entry() -> DiscoveryEntry {
    let mut entry = DiscoveryEntry::new("vehicle", "radio", "radio-1");
    entry.provider_version = Version::new(3, 2);
    entry.qos.priority = 42;
    entry.qos.supports_on_change_subscriptions = true;
    entry.qos.custom_parameters = vec![CustomParameter {
        name: "region".into(),
        value: "eu".into(),
    }];
    entry.public_key_id = "radio-key".into();
    entry
}

/// A restarted directory serves the persisted providers locally, with every
/// field intact and without asking the backend.
#[tokio::test]
async fn test_restart_restores_local_providers() {
    let scratch = scratch_dir("restart");
    let config = config_in(&scratch);

    let (first, _, _) = start(&config);
    first.add(rich_entry()).unwrap();
    first
        .add(DiscoveryEntry::new("vehicle", "gps", "gps-1").with_scope(ProviderScope::Local))
        .unwrap();
    first.flush_persisted_file().unwrap();
    drop(first);

    let (second, remote, _) = start(&config);
    assert_eq!(second.count_local_capabilities(), 2);
    assert_eq!(
        second.get_cached_local_capabilities_by_participant("radio-1"),
        vec![rich_entry()]
    );

    let found = second
        .lookup_async(&domains(&["vehicle"]), "radio", DiscoveryQos::default())
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["radio-1"]);
    assert!(found[0].is_local);
    assert_eq!(remote.lookup_calls(), 0);

    // Only the global-scope provider is staged for this node's global lookups.
    let staged = second.get_cached_global_discovery_entries();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].entry.participant_id, "radio-1");
    assert_eq!(staged[0].address, LOCAL_NODE);

    let _ = std::fs::remove_dir_all(&scratch);
}

/// Removals are persisted too.
#[tokio::test]
async fn test_removed_provider_stays_removed_after_restart() {
    let scratch = scratch_dir("removed");
    let config = config_in(&scratch);

    let (first, _, _) = start(&config);
    first.add(DiscoveryEntry::new("d1", "i1", "keep")).unwrap();
    first.add(DiscoveryEntry::new("d1", "i1", "gone")).unwrap();
    first.remove("gone");
    first.flush_persisted_file().unwrap();

    let (second, _, _) = start(&config);
    let local = second.get_cached_local_capabilities(&[InterfaceAddress::new("d1", "i1")]);
    let names: Vec<_> = local.iter().map(|e| e.participant_id.as_str()).collect();
    assert_eq!(names, vec!["keep"]);

    let _ = std::fs::remove_dir_all(&scratch);
}

/// A corrupt snapshot is logged and ignored; the directory starts empty and
/// overwrites it on the next flush.
#[tokio::test]
async fn test_corrupt_snapshot_is_not_fatal() {
    let scratch = scratch_dir("corrupt");
    let config = config_in(&scratch);
    std::fs::create_dir_all(&scratch).unwrap();
    std::fs::write(&config.persistence.local_capabilities_file, b"\x00\x01 garbage").unwrap();

    let (dir, _, _) = start(&config);
    assert_eq!(dir.count_local_capabilities(), 0);

    dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();
    dir.flush_persisted_file().unwrap();
    let (again, _, _) = start(&config);
    assert_eq!(again.count_local_capabilities(), 1);

    let _ = std::fs::remove_dir_all(&scratch);
}

/// Provisioned global entries are usable immediately and routed to the
/// address given in the file.
#[tokio::test]
async fn test_provisioned_entries_answer_global_lookups() -> Result<()> {
    let scratch = scratch_dir("provisioned");
    let provisioning = scratch.join("provisioned.json");
    write_provisioning(
        &provisioning,
        &[GlobalDiscoveryEntry::new(
            DiscoveryEntry::new("io.backend", "Discovery", "gcd"),
            "mqtt://backend:1883",
        )],
    )?;

    let mut config = config_in(&scratch);
    config.persistence.global_capabilities_file = provisioning;
    let (dir, remote, router) = start(&config);

    let found = dir
        .lookup_async(
            &domains(&["io.backend"]),
            "Discovery",
            DiscoveryQos::with_scope(DiscoveryScope::GlobalOnly),
        )
        .await?;
    assert_eq!(ids(&found), vec!["gcd"]);
    assert!(!found[0].is_local);
    assert_eq!(remote.lookup_calls(), 0);
    assert_eq!(router.hop("gcd").as_deref(), Some("mqtt://backend:1883"));
    assert_eq!(dir.count_local_capabilities(), 0);

    let _ = std::fs::remove_dir_all(&scratch);
    Ok(())
}

/// With persistence disabled nothing is written.
#[tokio::test]
async fn test_disabled_persistence_writes_nothing() {
    let scratch = scratch_dir("disabled");
    let mut config = config_in(&scratch);
    config.persistence.enabled = false;

    let (dir, _, _) = start(&config);
    dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();
    dir.flush_persisted_file().unwrap();
    settle().await;
    assert!(!config.persistence.local_capabilities_file.exists());
}

/// An explicit save goes wherever the caller asks.
#[tokio::test]
async fn test_save_to_explicit_path() -> Result<()> {
    let scratch = scratch_dir("explicit");
    let path = scratch.join("nested").join("export.json");
    let node = Node::new();
    node.dir.add(rich_entry()).unwrap();
    node.dir.save_local_capabilities_to_file(&path)?;

    let json = read_json(&path)?;
    assert_eq!(json["version"], 1);
    assert_eq!(json["local_entries"][0]["participant_id"], "radio-1");
    assert_eq!(json["global_registrations"][0], "radio-1");

    let restored = Node::new();
    assert_eq!(restored.dir.load_persisted_file(&path), 1);

    let _ = std::fs::remove_dir_all(&scratch);
    Ok(())
}
