//! Observer list with registration-ordered, panic-isolated dispatch.
//!
//! Both the connection and every channel expose their state changes through an
//! [`EventEmitter`]. Listeners are plain callbacks; `emit` snapshots the matching
//! listeners under the lock and invokes them after releasing it, so a listener
//! may register or deregister other listeners without deadlocking.

use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Entry<K, T> {
    id: u64,
    filter: Option<K>,
    once: bool,
    callback: Callback<T>,
}

struct Registry<K, T> {
    next_id: u64,
    entries: Vec<Entry<K, T>>,
}

trait Deregister: Send + Sync {
    fn deregister(&self, id: u64) -> bool;
}

impl<K: Send, T> Deregister for Mutex<Registry<K, T>> {
    fn deregister(&self, id: u64) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        registry.entries.len() != before
    }
}

/// Deregistration handle returned by `on`/`once`.
///
/// Dropping the handle does not deregister the listener; call [`off`](Self::off).
pub struct ListenerHandle {
    id: u64,
    registry: Weak<dyn Deregister>,
}

impl ListenerHandle {
    /// Removes the listener. Returns `false` if it was already removed
    /// (including a `once` listener that has fired).
    pub fn off(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.deregister(self.id))
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

pub struct EventEmitter<K, T> {
    registry: Arc<Mutex<Registry<K, T>>>,
}

impl<K, T> EventEmitter<K, T>
where
    K: PartialEq + Clone + Send + 'static,
    T: 'static,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers a listener for `filter` (or every event when `None`).
    pub fn on<F>(&self, filter: Option<K>, callback: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(filter, false, Arc::new(callback))
    }

    /// Registers a listener that fires at most once and then removes itself.
    pub fn once<F>(&self, filter: Option<K>, callback: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(filter, true, Arc::new(callback))
    }

    fn register(&self, filter: Option<K>, once: bool, callback: Callback<T>) -> ListenerHandle {
        let id = {
            let mut registry = self.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.entries.push(Entry {
                id,
                filter,
                once,
                callback,
            });
            id
        };

        let registry: Arc<dyn Deregister> = self.registry.clone();
        ListenerHandle {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Delivers `payload` to every listener matching `event`, in registration order.
    ///
    /// A panicking listener is logged and skipped; later listeners still run.
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &K, payload: &T) -> usize {
        let callbacks: Vec<Callback<T>> = {
            let mut registry = self.registry.lock();
            let mut matched = Vec::new();
            registry.entries.retain(|entry| {
                let matches = entry.filter.as_ref().is_none_or(|filter| filter == event);
                if matches {
                    matched.push(Arc::clone(&entry.callback));
                }
                !(matches && entry.once)
            });
            matched
        };

        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                tracing::error!("State change listener panicked; continuing with remaining listeners");
            }
        }

        callbacks.len()
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn clear(&self) {
        self.registry.lock().entries.clear();
    }
}

impl<K, T> Default for EventEmitter<K, T>
where
    K: PartialEq + Clone + Send + 'static,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Clone for EventEmitter<K, T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}
