use std::collections::HashMap;
use std::hash::Hash;
use tokio::task::JoinHandle;

/// Manages background tasks with proper lifecycle handling.
///
/// Keyed tasks replace (and abort) any earlier task under the same key, which
/// is how timers are rescheduled and cancelled.
pub struct TaskManager<K> {
    keyed: HashMap<K, JoinHandle<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl<K: Eq + Hash> TaskManager<K> {
    /// Create a new empty task manager
    pub fn new() -> Self {
        Self {
            keyed: HashMap::new(),
            handles: Vec::new(),
        }
    }

    /// Spawn a task and track it
    pub fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.retain(|handle| !handle.is_finished());
        let handle = tokio::spawn(future);
        self.handles.push(handle);
    }

    /// Spawn a task under `key`, aborting the task previously stored there
    pub fn spawn_keyed<F>(&mut self, key: K, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        if let Some(previous) = self.keyed.insert(key, handle) {
            previous.abort();
        }
    }

    /// Abort the task stored under `key`, if any
    pub fn abort(&mut self, key: &K) {
        if let Some(handle) = self.keyed.remove(key) {
            handle.abort();
        }
    }

    /// Abort every keyed task matching `predicate`
    pub fn abort_where(&mut self, predicate: impl Fn(&K) -> bool) {
        self.keyed.retain(|key, handle| {
            if predicate(key) {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Abort all tracked tasks and wait for them to finish
    pub async fn shutdown(mut self) {
        let keyed = std::mem::take(&mut self.keyed);
        for handle in keyed.into_values().chain(self.handles.drain(..)) {
            handle.abort();
            // Ignore errors from aborted tasks
            let _ = handle.await;
        }
    }

    /// Abort all tasks without waiting
    pub fn abort_all(&mut self) {
        for (_, handle) in self.keyed.drain() {
            handle.abort();
        }
        for handle in &self.handles {
            handle.abort();
        }
        self.handles.clear();
    }
}

impl<K: Eq + Hash> Default for TaskManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TaskManager<K> {
    fn drop(&mut self) {
        for handle in self.keyed.values().chain(self.handles.iter()) {
            handle.abort();
        }
    }
}
