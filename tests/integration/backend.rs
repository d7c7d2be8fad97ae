use crate::*;
use std::time::Duration;

use capdir_core::ProviderScope;
use capdir_services::RemoteDirectory;

// ══════════════════════════════════════════════════════════════════════════════
//  What the backend ends up holding for this node
// ══════════════════════════════════════════════════════════════════════════════

/// Poll until `check` holds, for at most a second of wall time.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Add/remove churn from several threads leaves the backend agreeing with
/// the local tier once the queue drains.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backend_matches_local_tier_after_churn() {
    let node = Node::new();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let dir = node.dir.clone();
            std::thread::spawn(move || {
                let id = format!("p{t}");
                for _ in 0..25 {
                    dir.add(DiscoveryEntry::new("d1", "i1", id.as_str())).unwrap();
                    dir.remove(&id);
                }
                if t % 2 == 1 {
                    dir.add(DiscoveryEntry::new("d1", "i1", id.as_str())).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Queued last, so everything before it has been applied once it lands.
    node.dir
        .add(DiscoveryEntry::new("d1", "i1", "marker"))
        .unwrap();
    assert!(eventually(|| node.remote.contains("marker")).await);

    for t in 0..4 {
        let id = format!("p{t}");
        assert_eq!(node.remote.contains(&id), t % 2 == 1, "{id}");
    }
    assert_eq!(node.remote.len(), 3);
    assert_eq!(node.dir.count_local_capabilities(), 3);
}

/// A provider narrowed from global to local scope disappears from the
/// backend, even when both registrations are issued back to back.
#[tokio::test]
async fn test_scope_narrowing_unpublishes() {
    let node = Node::new();
    node.dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();
    node.dir
        .add(DiscoveryEntry::new("d1", "i1", "p1").with_scope(ProviderScope::Local))
        .unwrap();
    settle().await;

    assert!(!node.remote.contains("p1"));
    assert_eq!(node.dir.count_local_capabilities(), 1);
    assert_eq!(node.dir.count_global_capabilities(), 0);
}

/// On start, entries an earlier run of this node left on the backend are
/// removed. Entries of other nodes and of this run stay.
#[tokio::test]
async fn test_startup_removes_leftovers_of_earlier_run() {
    let node = Node::new();
    let mut leftover =
        GlobalDiscoveryEntry::new(DiscoveryEntry::new("d1", "i1", "old"), LOCAL_NODE);
    leftover.entry.last_seen_date_ms = START_MS - 60_000;
    node.remote.insert(leftover);
    node.publish_remote("d1", "i1", "elsewhere");
    node.dir.add(DiscoveryEntry::new("d1", "i1", "mine")).unwrap();
    settle().await;

    let handle = node.dir.start_maintenance();
    settle().await;
    handle.shutdown().await;

    assert_eq!(node.remote.remove_stale_calls(), 1);
    assert!(!node.remote.contains("old"));
    assert!(node.remote.contains("elsewhere"));
    assert!(node.remote.contains("mine"));
}

/// After the backend lost its state, re-registration puts every global
/// provider of this node back with a current last-seen date.
#[tokio::test]
async fn test_reregistration_restores_lost_backend_state() {
    let node = Node::new();
    node.dir.add(DiscoveryEntry::new("d1", "i1", "g1")).unwrap();
    node.dir.add(DiscoveryEntry::new("d2", "i1", "g2")).unwrap();
    node.dir
        .add(DiscoveryEntry::new("d1", "i1", "l1").with_scope(ProviderScope::Local))
        .unwrap();
    settle().await;
    node.remote
        .remove(&["g1".to_string(), "g2".to_string()])
        .await
        .unwrap();
    assert!(node.remote.is_empty());

    node.clock.advance(Duration::from_secs(90));
    assert_eq!(node.dir.trigger_global_provider_reregistration(), 2);
    settle().await;

    assert_eq!(node.remote.len(), 2);
    let g1 = node.remote.get("g1").unwrap();
    assert_eq!(g1.address, LOCAL_NODE);
    assert_eq!(g1.entry.last_seen_date_ms, START_MS + 90_000);
    assert!(!node.remote.contains("l1"));
}
