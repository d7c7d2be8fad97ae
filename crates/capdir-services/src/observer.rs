//! Provider registration observers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use capdir_core::DiscoveryEntry;

/// Notified synchronously on the mutating caller's thread. Implementations
/// must return quickly and must not call back into the directory.
pub trait ProviderRegistrationObserver: Send + Sync {
    fn on_provider_add(&self, entry: &DiscoveryEntry);
    fn on_provider_remove(&self, entry: &DiscoveryEntry);
}

/// Observers in registration order.
#[derive(Default)]
pub struct ObserverList {
    observers: Mutex<Vec<Arc<dyn ProviderRegistrationObserver>>>,
}

#[derive(Clone, Copy)]
enum Event {
    Add,
    Remove,
}

impl ObserverList {
    pub fn add(&self, observer: Arc<dyn ProviderRegistrationObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Detach by identity. Returns whether the observer was attached.
    pub fn remove(&self, observer: &Arc<dyn ProviderRegistrationObserver>) -> bool {
        let mut list = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = list.len();
        list.retain(|o| !same_observer(o, observer));
        list.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_add(&self, entry: &DiscoveryEntry) {
        self.notify(Event::Add, entry);
    }

    pub fn notify_remove(&self, entry: &DiscoveryEntry) {
        self.notify(Event::Remove, entry);
    }

    fn notify(&self, event: Event, entry: &DiscoveryEntry) {
        let snapshot: Vec<_> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| match event {
                Event::Add => observer.on_provider_add(entry),
                Event::Remove => observer.on_provider_remove(entry),
            }));
            if outcome.is_err() {
                tracing::warn!(
                    participant_id = %entry.participant_id,
                    "registration observer panicked"
                );
            }
        }
    }
}

fn same_observer(
    a: &Arc<dyn ProviderRegistrationObserver>,
    b: &Arc<dyn ProviderRegistrationObserver>,
) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
