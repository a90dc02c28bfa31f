//! Copy-on-write listener registry.
//!
//! Dispatch always iterates a snapshot taken under the lock, so a listener
//! may add or remove listeners (including itself) while being notified.

use parking_lot::RwLock;
use std::sync::Arc;

pub struct ListenerList<T: ?Sized> {
    listeners: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> ListenerList<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Arc<T>) {
        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, listener: &Arc<T>) {
        let mut guard = self.listeners.write();
        let next: Vec<Arc<T>> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.listeners.read().clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for ListenerList<T> {
    fn default() -> Self {
        Self::new()
    }
}
