use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::ChannelEvent;

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ChannelEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ChannelEvent) + Send + Sync,
{
    fn on_event(&self, event: &ChannelEvent) {
        (self)(event)
    }
}

/// Listener handle. Registration identity is the `Arc` allocation, so keep
/// the handle around to remove it later.
pub type Listener = Arc<dyn EventListener>;

/// Set of listeners; each allocation is held at most once.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the listener was already registered.
    pub fn add(&self, listener: &Listener) -> bool {
        let mut guard = self.listeners.write();
        if guard.iter().any(|existing| Arc::ptr_eq(existing, listener)) {
            return false;
        }
        guard.push(Arc::clone(listener));
        true
    }

    /// Returns `false` when the listener was not registered.
    pub fn remove(&self, listener: &Listener) -> bool {
        let mut guard = self.listeners.write();
        let before = guard.len();
        guard.retain(|existing| !Arc::ptr_eq(existing, listener));
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invokes every listener registered at call time. A panicking listener
    /// is logged and skipped; the rest still receive the event. Returns the
    /// number of listeners that completed normally.
    pub fn dispatch(&self, event: &ChannelEvent) -> usize {
        // Snapshot so listeners may (un)register from inside a callback.
        let snapshot: Vec<Listener> = self.listeners.read().clone();
        let mut delivered = 0usize;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(
                        target = "event_channel",
                        kind = ?event.kind,
                        reason = %reason,
                        "listener panicked; continuing dispatch"
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(kind: &str) -> ChannelEvent {
        ChannelEvent {
            kind: Some(kind.to_string()),
            event_id: None,
            payload: serde_json::json!({ "type": kind }),
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &ChannelEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = counting(&hits);

        assert!(registry.add(&listener));
        assert!(!registry.add(&listener));
        assert_eq!(registry.len(), 1);

        registry.dispatch(&event("order_shipped"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_unknown_listener_keeps_size() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let registered = counting(&hits);
        let stranger = counting(&hits);
        registry.add(&registered);

        assert!(!registry.remove(&stranger));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&registered));
        assert!(registry.is_empty());
        assert!(!registry.remove(&registered));
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let before = counting(&hits);
        let faulty: Listener = Arc::new(|_: &ChannelEvent| panic!("render failed"));
        let after = counting(&hits);
        registry.add(&before);
        registry.add(&faulty);
        registry.add(&after);

        let delivered = registry.dispatch(&event("new_message"));

        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_may_unregister_itself_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<parking_lot::Mutex<Option<Listener>>> = Arc::default();
        let listener: Listener = {
            let registry = Arc::clone(&registry);
            let slot = Arc::clone(&slot);
            Arc::new(move |_: &ChannelEvent| {
                if let Some(me) = slot.lock().take() {
                    registry.remove(&me);
                }
            })
        };
        *slot.lock() = Some(Arc::clone(&listener));
        registry.add(&listener);

        assert_eq!(registry.dispatch(&event("new_message")), 1);
        assert!(registry.is_empty());
    }
}
