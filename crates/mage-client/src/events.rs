//! Named publish/subscribe bus.
//!
//! Listeners are plain closures registered under an event name (a server
//! event such as `session.set`, or a cache topic). Emission clones the
//! listener list first, so a listener may register or remove listeners
//! while it runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Listener closure for payloads of type `T`.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Name → ordered listeners.
pub struct EventBus<T> {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener<T>)>>>,
    next_id: AtomicU64,
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for `name`.
    pub fn on<F>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(existing, _)| *existing != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Invoke every listener of `name` in registration order.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, name: &str, payload: &T) -> usize {
        let listeners: Vec<Listener<T>> = {
            let map = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            match map.get(name) {
                Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
                None => return 0,
            }
        };

        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = map.keys().collect();
        names.sort();
        f.debug_struct("EventBus").field("events", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_in_registration_order() {
        let bus: EventBus<i32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        bus.on("tick", move |v| s1.lock().unwrap().push(("first", *v)));
        let s2 = seen.clone();
        bus.on("tick", move |v| s2.lock().unwrap().push(("second", *v)));

        assert_eq!(bus.emit("tick", &4), 2);
        assert_eq!(bus.emit("other", &5), 0);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 4), ("second", 4)]);
    }

    #[test]
    fn test_off() {
        let bus: EventBus<()> = EventBus::new();
        let id = bus.on("a", |_| {});
        bus.on("a", |_| {});

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count("a"), 1);
        assert_eq!(bus.emit("a", &()), 1);
    }

    #[test]
    fn test_listener_can_register_during_emit() {
        let bus: Arc<EventBus<()>> = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.on("a", move |_| {
            inner.on("b", |_| {});
        });

        bus.emit("a", &());
        assert_eq!(bus.listener_count("b"), 1);
    }
}
