//! Event model and listener activation table
//!
//! Instrumented invocations surface as [`ProbeEvent`]s. A watch registration
//! binds an [`EventListener`] to the event kinds it subscribes to; whether a
//! listener actually fires is governed by the process-wide [`ListenerTable`],
//! which the lifecycle controller mutates on activate/freeze transitions.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Kinds of invocation events a watch can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventKind {
    /// A matched function was entered.
    Enter,
    /// A matched function returned normally.
    Exit,
    /// A matched function failed.
    Fault,
}

/// An invocation event delivered to listeners.
#[derive(Debug, Clone)]
pub struct ProbeEvent {
    pub kind: EventKind,
    pub type_name: String,
    pub function: String,
}

impl ProbeEvent {
    pub fn new(kind: EventKind, type_name: &str, function: &str) -> Self {
        Self {
            kind,
            type_name: type_name.to_string(),
            function: function.to_string(),
        }
    }

    pub fn enter(type_name: &str, function: &str) -> Self {
        Self::new(EventKind::Enter, type_name, function)
    }

    pub fn exit(type_name: &str, function: &str) -> Self {
        Self::new(EventKind::Exit, type_name, function)
    }

    pub fn fault(type_name: &str, function: &str) -> Self {
        Self::new(EventKind::Fault, type_name, function)
    }
}

/// Listener invoked for matched invocation events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ProbeEvent) -> anyhow::Result<()>;
}

/// Stable identifier assigned to a listener object by the identity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Identifier of a watch registration. Monotonically increasing, never
/// reused within the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// Identity table mapping listener objects to stable [`ListenerId`]s.
///
/// The same listener instance observed twice gets the same id, so a listener
/// shared across watches has a single activation entry. Ids are never
/// reassigned.
pub struct ListenerIdTable {
    next: AtomicU64,
    ids: Mutex<HashMap<usize, ListenerId>>,
}

impl ListenerIdTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1000),
            ids: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve (or assign) the stable id for a listener instance.
    pub fn id_of(&self, listener: &Arc<dyn EventListener>) -> ListenerId {
        let key = Arc::as_ptr(listener) as *const () as usize;
        let mut ids = self.ids.lock();
        *ids.entry(key)
            .or_insert_with(|| ListenerId(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

impl Default for ListenerIdTable {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveListener {
    listener: Arc<dyn EventListener>,
    kinds: Vec<EventKind>,
}

/// Process-wide event-listener activation table.
///
/// Owned by the runtime context and mutated only through lifecycle
/// transitions (and by watch/delete on an already-active module), never
/// directly by modules.
#[derive(Default)]
pub struct ListenerTable {
    inner: Mutex<HashMap<ListenerId, ActiveListener>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a listener for the given event kinds.
    pub fn activate(&self, id: ListenerId, listener: Arc<dyn EventListener>, kinds: &[EventKind]) {
        debug!(%id, ?kinds, "activating event listener");
        let mut inner = self.inner.lock();
        inner.insert(
            id,
            ActiveListener {
                listener,
                kinds: kinds.to_vec(),
            },
        );
    }

    /// Disable a listener. Idempotent.
    pub fn frozen(&self, id: ListenerId) {
        debug!(%id, "freezing event listener");
        let mut inner = self.inner.lock();
        inner.remove(&id);
    }

    pub fn is_active(&self, id: ListenerId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Event kinds the listener is currently enabled for.
    pub fn subscribed_kinds(&self, id: ListenerId) -> Option<Vec<EventKind>> {
        self.inner.lock().get(&id).map(|a| a.kinds.clone())
    }

    /// Deliver an event to one listener, if it is active and subscribed to
    /// the event's kind. Listener failures are logged, never propagated.
    pub fn dispatch(&self, id: ListenerId, event: &ProbeEvent) -> bool {
        let listener = {
            let inner = self.inner.lock();
            match inner.get(&id) {
                Some(active) if active.kinds.contains(&event.kind) => active.listener.clone(),
                _ => return false,
            }
        };
        if let Err(e) = listener.on_event(event) {
            warn!(%id, error = %e, "event listener failed");
        }
        true
    }

    /// Deliver an event to every active listener subscribed to its kind.
    /// Returns the number of listeners that fired.
    pub fn dispatch_all(&self, event: &ProbeEvent) -> usize {
        let listeners: Vec<(ListenerId, Arc<dyn EventListener>)> = {
            let inner = self.inner.lock();
            inner
                .iter()
                .filter(|(_, active)| active.kinds.contains(&event.kind))
                .map(|(id, active)| (*id, active.listener.clone()))
                .collect()
        };
        let fired = listeners.len();
        for (id, listener) in listeners {
            if let Err(e) = listener.on_event(event) {
                warn!(%id, error = %e, "event listener failed");
            }
        }
        fired
    }

    /// Count of active listeners subscribed to the given kind.
    pub fn subscription_count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|a| a.kinds.contains(&kind))
            .count()
    }
}

/// Snapshot of the event machinery, for monitoring surfaces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventPoolInfo {
    /// Listeners currently enabled in the activation table
    pub active_listeners: usize,
    /// Live watch registrations across all modules
    pub total_watches: usize,
    /// Active listeners subscribed to `Enter`
    pub enter_subscriptions: usize,
    /// Active listeners subscribed to `Exit`
    pub exit_subscriptions: usize,
    /// Active listeners subscribed to `Fault`
    pub fault_subscriptions: usize,
}

/// Injectable monitoring capability exposing the event pool state.
pub trait EventMonitor: Send + Sync {
    fn event_pool_info(&self) -> EventPoolInfo;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        hits: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl EventListener for CountingListener {
        fn on_event(&self, _event: &ProbeEvent) -> anyhow::Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_listener_id_table_is_identity_based() {
        let table = ListenerIdTable::new();
        let a: Arc<dyn EventListener> = CountingListener::new();
        let b: Arc<dyn EventListener> = CountingListener::new();

        let id_a = table.id_of(&a);
        let id_b = table.id_of(&b);
        assert_ne!(id_a, id_b);
        assert_eq!(table.id_of(&a), id_a);
        assert_eq!(table.id_of(&a.clone()), id_a);
    }

    #[test]
    fn test_activate_and_frozen() {
        let table = ListenerTable::new();
        let listener = CountingListener::new();
        let id = ListenerId(1);

        table.activate(id, listener.clone(), &[EventKind::Enter]);
        assert!(table.is_active(id));
        assert_eq!(table.active_count(), 1);

        table.frozen(id);
        assert!(!table.is_active(id));
        // Freezing twice is harmless.
        table.frozen(id);
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn test_dispatch_respects_kind_subscription() {
        let table = ListenerTable::new();
        let listener = CountingListener::new();
        let id = ListenerId(7);

        table.activate(id, listener.clone(), &[EventKind::Enter, EventKind::Fault]);

        assert!(table.dispatch(id, &ProbeEvent::enter("svc::Server", "handle")));
        assert!(!table.dispatch(id, &ProbeEvent::exit("svc::Server", "handle")));
        assert!(table.dispatch(id, &ProbeEvent::fault("svc::Server", "handle")));
        assert_eq!(listener.hits(), 2);
    }

    #[test]
    fn test_dispatch_after_frozen_does_not_fire() {
        let table = ListenerTable::new();
        let listener = CountingListener::new();
        let id = ListenerId(9);

        table.activate(id, listener.clone(), &[EventKind::Enter]);
        table.frozen(id);

        assert!(!table.dispatch(id, &ProbeEvent::enter("t", "f")));
        assert_eq!(listener.hits(), 0);
    }

    #[test]
    fn test_dispatch_all_counts_fired_listeners() {
        let table = ListenerTable::new();
        let a = CountingListener::new();
        let b = CountingListener::new();

        table.activate(ListenerId(1), a.clone(), &[EventKind::Enter]);
        table.activate(ListenerId(2), b.clone(), &[EventKind::Exit]);

        let fired = table.dispatch_all(&ProbeEvent::enter("t", "f"));
        assert_eq!(fired, 1);
        assert_eq!(a.hits(), 1);
        assert_eq!(b.hits(), 0);
        assert_eq!(table.subscription_count(EventKind::Exit), 1);
    }
}
