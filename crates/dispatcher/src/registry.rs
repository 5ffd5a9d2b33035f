use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::booking::BookingRegistry;
use crate::tracker::TaskTracker;

/// Trackers of one scheduler keyed by execution name, plus their bookings.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<TaskTracker>>>,
    bookings: BookingRegistry,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bookings(&self) -> &BookingRegistry {
        &self.bookings
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskTracker>> {
        self.lock().get(name).cloned()
    }

    pub fn insert(&self, tracker: Arc<TaskTracker>) {
        self.lock().insert(tracker.name().to_string(), tracker);
    }

    /// Removes `name` only if it still maps to `tracker`; a newer tracker
    /// registered under the same name is left alone.
    pub fn remove_if_same(&self, name: &str, tracker: &TaskTracker) -> bool {
        let mut tasks = self.lock();
        match tasks.get(name) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), tracker) => {
                tasks.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Trackers load balancing and session recovery still act on.
    pub fn active(&self) -> Vec<Arc<TaskTracker>> {
        self.lock()
            .values()
            .filter(|tracker| tracker.is_active())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<TaskTracker>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskTracker>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
