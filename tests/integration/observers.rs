use crate::*;

use capdir_core::ProviderScope;

// ══════════════════════════════════════════════════════════════════════════════
//  Registration observers
// ══════════════════════════════════════════════════════════════════════════════

struct Panicky;

impl ProviderRegistrationObserver for Panicky {
    fn on_provider_add(&self, _entry: &DiscoveryEntry) {
        panic!("observer failure");
    }

    fn on_provider_remove(&self, _entry: &DiscoveryEntry) {
        panic!("observer failure");
    }
}

fn attach(node: &Node) -> Arc<EventLog> {
    let log = Arc::new(EventLog::default());
    node.dir
        .add_provider_registration_observer(log.clone() as Arc<dyn ProviderRegistrationObserver>);
    log
}

#[tokio::test]
async fn test_events_follow_call_order() {
    let node = Node::new();
    let log = attach(&node);

    node.dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();
    node.dir
        .add(DiscoveryEntry::new("d1", "i1", "p2").with_scope(ProviderScope::Local))
        .unwrap();
    node.dir.remove("p1");
    node.dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();

    assert_eq!(log.events(), vec!["add:p1", "add:p2", "remove:p1", "add:p1"]);
}

/// Every observer sees every event, in registration order.
#[tokio::test]
async fn test_all_observers_notified_in_order() {
    let node = Node::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    struct Tagged(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);
    impl ProviderRegistrationObserver for Tagged {
        fn on_provider_add(&self, _entry: &DiscoveryEntry) {
            self.1.lock().unwrap().push(self.0);
        }
        fn on_provider_remove(&self, _entry: &DiscoveryEntry) {}
    }

    for tag in ["first", "second", "third"] {
        node.dir
            .add_provider_registration_observer(Arc::new(Tagged(tag, order.clone())));
    }
    node.dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_panicking_observer_does_not_block_others() {
    let node = Node::new();
    node.dir.add_provider_registration_observer(Arc::new(Panicky));
    let log = attach(&node);

    node.dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();
    node.dir.remove("p1");

    assert_eq!(log.events(), vec!["add:p1", "remove:p1"]);
    assert_eq!(node.dir.count_local_capabilities(), 0);
}

#[tokio::test]
async fn test_detached_observer_is_silent() {
    let node = Node::new();
    let log = Arc::new(EventLog::default());
    let handle: Arc<dyn ProviderRegistrationObserver> = log.clone();
    node.dir.add_provider_registration_observer(handle.clone());

    node.dir.add(DiscoveryEntry::new("d1", "i1", "p1")).unwrap();
    assert!(node.dir.remove_provider_registration_observer(&handle));
    assert!(!node.dir.remove_provider_registration_observer(&handle));
    node.dir.remove("p1");

    assert_eq!(log.events(), vec!["add:p1"]);
}

/// A batch removal reports each removed provider once, in batch order, and
/// skips unknown ids.
#[tokio::test]
async fn test_batch_removal_events() {
    let node = Node::new();
    for id in ["a", "b", "c"] {
        node.dir.add(DiscoveryEntry::new("d1", "i1", id)).unwrap();
    }
    settle().await;
    let log = attach(&node);

    node.dir
        .remove_entries(&["c".to_string(), "unknown".to_string(), "a".to_string()]);
    settle().await;

    assert_eq!(log.events(), vec!["remove:c", "remove:a"]);
    assert!(!node.remote.contains("a"));
    assert!(node.remote.contains("b"));
    assert!(!node.remote.contains("c"));
}

/// Backend traffic never reaches registration observers.
#[tokio::test]
async fn test_received_capabilities_are_not_observed() {
    let node = Node::new();
    let log = attach(&node);

    node.dir.register_received_capabilities([(
        REMOTE_NODE.to_string(),
        DiscoveryEntry::new("d1", "i1", "remote-p"),
    )]);
    node.dir
        .remove_received_capabilities(&["remote-p".to_string()]);

    assert!(log.events().is_empty());
}

/// Add/remove pairs issued from several threads arrive at the observer in
/// per-participant call order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_mutations_keep_per_participant_order() {
    let node = Node::new();
    let log = attach(&node);

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let dir = node.dir.clone();
            std::thread::spawn(move || {
                let id = format!("p{t}");
                for _ in 0..25 {
                    dir.add(DiscoveryEntry::new("d1", "i1", id.as_str())).unwrap();
                    dir.remove(&id);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let events = log.events();
    assert_eq!(events.len(), 4 * 25 * 2);
    for t in 0..4 {
        let mine: Vec<_> = events
            .iter()
            .filter(|e| e.ends_with(&format!(":p{t}")))
            .collect();
        for (i, event) in mine.iter().enumerate() {
            let expected = if i % 2 == 0 { "add" } else { "remove" };
            assert!(event.starts_with(expected), "p{t} event {i} was {event}");
        }
    }
    assert_eq!(node.dir.count_local_capabilities(), 0);
}
