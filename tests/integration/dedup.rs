use crate::*;
use std::time::Duration;

use capdir_core::{DiscoveryQos, DiscoveryScope, LookupError, ProviderScope, RemoteError};
use capdir_services::LookupResult;
use tokio::sync::oneshot;

// ══════════════════════════════════════════════════════════════════════════════
//  In-flight remote lookups are shared between callers
// ══════════════════════════════════════════════════════════════════════════════

fn start_lookup(
    node: &Node,
    names: &[&str],
    qos: DiscoveryQos,
) -> oneshot::Receiver<LookupResult> {
    let (tx, rx) = oneshot::channel();
    node.dir.lookup(&domains(names), "i1", qos, Box::new(tx));
    rx
}

fn start_participant_lookup(
    node: &Node,
    participant_id: &str,
) -> oneshot::Receiver<LookupResult> {
    let (tx, rx) = oneshot::channel();
    node.dir
        .lookup_participant(participant_id, DiscoveryQos::default(), Box::new(tx));
    rx
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_remote_call() {
    let node = Node::new();
    node.publish_remote("d1", "i1", "p-remote");
    node.remote.hold_lookups();

    let qos = DiscoveryQos::with_scope(DiscoveryScope::LocalAndGlobal);
    let first = start_lookup(&node, &["d1"], qos.clone());
    let second = start_lookup(&node, &["d1"], qos);
    settle().await;

    assert!(node.dir.has_pending_lookups());
    assert_eq!(node.remote.lookup_calls(), 1);

    node.remote.release_lookups();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(ids(&first), vec!["p-remote"]);
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(node.remote.lookup_calls(), 1);
    assert!(!node.dir.has_pending_lookups());
}

/// Callers asking for different address sets do not share a remote call.
#[tokio::test]
async fn test_different_address_sets_are_not_merged() {
    let node = Node::new();
    node.publish_remote("d1", "i1", "p1");
    node.publish_remote("d2", "i1", "p2");
    node.remote.hold_lookups();

    let qos = DiscoveryQos::with_scope(DiscoveryScope::GlobalOnly);
    let narrow = start_lookup(&node, &["d1"], qos.clone());
    let wide = start_lookup(&node, &["d1", "d2"], qos);
    settle().await;
    assert_eq!(node.remote.lookup_calls(), 2);

    node.remote.release_lookups();
    assert_eq!(ids(&narrow.await.unwrap().unwrap()), vec!["p1"]);
    assert_eq!(ids(&wide.await.unwrap().unwrap()), vec!["p1", "p2"]);
}

/// A failed remote call fails every caller that joined it.
#[tokio::test]
async fn test_remote_error_reaches_every_waiter() {
    let node = Node::new();
    node.remote.hold_lookups();

    let qos = DiscoveryQos::with_scope(DiscoveryScope::GlobalOnly);
    let waiters: Vec<_> = (0..3)
        .map(|_| start_lookup(&node, &["d1"], qos.clone()))
        .collect();
    settle().await;
    assert_eq!(node.remote.lookup_calls(), 1);

    node.remote.set_available(false);
    node.remote.release_lookups();
    for rx in waiters {
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            LookupError::Remote(RemoteError::Unavailable(_))
        ));
    }
    assert!(!node.dir.has_pending_lookups());
}

/// A LOCAL_THEN_GLOBAL caller is answered as soon as a matching provider
/// registers locally; the remote answer arriving later changes nothing.
#[tokio::test]
async fn test_local_registration_satisfies_waiting_lookup() {
    let node = Node::new();
    node.publish_remote("d1", "i1", "p-remote");
    node.remote.hold_lookups();

    let mut waiting = start_lookup(&node, &["d1"], DiscoveryQos::default());
    settle().await;
    assert!(waiting.try_recv().is_err());

    node.dir
        .add(DiscoveryEntry::new("d1", "i1", "p-local").with_scope(ProviderScope::Local))
        .unwrap();
    let found = waiting.await.unwrap().unwrap();
    assert_eq!(ids(&found), vec!["p-local"]);
    assert!(found[0].is_local);
    assert!(!node.dir.has_pending_lookups());

    node.remote.release_lookups();
    settle().await;
    assert_eq!(node.remote.lookup_calls(), 1);
}

/// Callers of other scopes joined to the same call still wait for the
/// remote answer, and see the new local provider in it.
#[tokio::test]
async fn test_local_registration_leaves_other_scopes_waiting() {
    let node = Node::new();
    node.publish_remote("d1", "i1", "p-remote");
    node.remote.hold_lookups();

    let mut both = start_lookup(
        &node,
        &["d1"],
        DiscoveryQos::with_scope(DiscoveryScope::LocalAndGlobal),
    );
    let then = start_lookup(&node, &["d1"], DiscoveryQos::default());
    settle().await;
    assert_eq!(node.remote.lookup_calls(), 1);

    node.dir
        .add(DiscoveryEntry::new("d1", "i1", "p-local").with_scope(ProviderScope::Local))
        .unwrap();
    assert_eq!(ids(&then.await.unwrap().unwrap()), vec!["p-local"]);
    assert!(both.try_recv().is_err());
    assert!(node.dir.has_pending_lookups());

    node.remote.release_lookups();
    let found = both.await.unwrap().unwrap();
    assert_eq!(ids(&found), vec!["p-local", "p-remote"]);
}

#[tokio::test]
async fn test_concurrent_participant_lookups_share_one_remote_call() {
    let node = Node::new();
    node.publish_remote("d1", "i1", "p7");
    node.remote.hold_lookups();

    let first = start_participant_lookup(&node, "p7");
    let second = start_participant_lookup(&node, "p7");
    let other = start_participant_lookup(&node, "p8");
    settle().await;
    assert_eq!(node.remote.lookup_calls(), 2);

    node.remote.release_lookups();
    assert_eq!(ids(&first.await.unwrap().unwrap()), vec!["p7"]);
    assert_eq!(ids(&second.await.unwrap().unwrap()), vec!["p7"]);
    assert!(other.await.unwrap().unwrap().is_empty());
    assert_eq!(node.router.hop("p7").as_deref(), Some(REMOTE_NODE));
}

/// A lookup that outlives its timeout fails with `Timeout`, and a later
/// lookup issues a fresh remote call.
#[tokio::test(start_paused = true)]
async fn test_slow_remote_times_out() {
    let node = Node::new();
    node.publish_remote("d1", "i1", "p1");
    node.remote.set_latency(Duration::from_secs(10));

    let mut qos = DiscoveryQos::with_scope(DiscoveryScope::GlobalOnly);
    qos.discovery_timeout_ms = 1_000;
    let err = node
        .dir
        .lookup_async(&domains(&["d1"]), "i1", qos.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, LookupError::Remote(RemoteError::Timeout(_))));
    assert!(!node.dir.has_pending_lookups());

    node.remote.set_latency(Duration::ZERO);
    let found = node
        .dir
        .lookup_async(&domains(&["d1"]), "i1", qos)
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["p1"]);
    assert_eq!(node.remote.lookup_calls(), 2);
}

/// Clearing the directory fails callers still waiting on the backend.
#[tokio::test]
async fn test_clear_abandons_waiting_lookups() {
    let node = Node::new();
    node.remote.hold_lookups();
    let waiting = start_lookup(
        &node,
        &["d1"],
        DiscoveryQos::with_scope(DiscoveryScope::GlobalOnly),
    );
    settle().await;

    node.dir.clear();
    assert!(matches!(
        waiting.await.unwrap().unwrap_err(),
        LookupError::Abandoned
    ));
    node.remote.release_lookups();
    settle().await;
    assert!(!node.dir.has_pending_lookups());
}
