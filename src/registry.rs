//! Per-resource observer sets.

use crate::types::{ObserveAction, ObserverEntry, ObserverId, ResourceHandle};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::debug;

/// Observers attached to each resource.
///
/// Mutated only through register/unregister (usually driven by the observe
/// option of an incoming request); read by the notification dispatcher.
pub struct SubscriptionRegistry {
    sets: RwLock<HashMap<ResourceHandle, Vec<ObserverEntry>>>,
    /// Woken with the resource handle whenever an observer is added.
    watchers: Mutex<Vec<Sender<ResourceHandle>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Add `observer` to `resource`'s set.
    ///
    /// Idempotent on observer id. Returns true if the observer was added.
    pub fn register(&self, resource: ResourceHandle, observer: ObserverEntry) -> bool {
        let added = {
            let mut sets = self.sets.write();
            let set = sets.entry(resource).or_default();
            if set.iter().any(|o| o.id == observer.id) {
                false
            } else {
                debug!(%resource, observer = ?observer.id, peer = %observer.peer, "observer registered");
                set.push(observer);
                true
            }
        };

        if added {
            self.wake_watchers(resource);
        }
        added
    }

    /// Remove every entry for `observer` from `resource`'s set.
    ///
    /// Idempotent. Returns true if anything was removed.
    pub fn unregister(&self, resource: ResourceHandle, observer: ObserverId) -> bool {
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(&resource) else {
            return false;
        };
        let before = set.len();
        set.retain(|o| o.id != observer);
        let removed = set.len() != before;
        if set.is_empty() {
            sets.remove(&resource);
        }
        if removed {
            debug!(%resource, ?observer, "observer unregistered");
        }
        removed
    }

    /// Apply the observe action carried by a request.
    pub fn apply(
        &self,
        resource: ResourceHandle,
        action: ObserveAction,
        observer: ObserverEntry,
    ) -> bool {
        match action {
            ObserveAction::Register => self.register(resource, observer),
            ObserveAction::Unregister => self.unregister(resource, observer.id),
        }
    }

    /// Snapshot of `resource`'s observers.
    pub fn observers(&self, resource: ResourceHandle) -> Vec<ObserverEntry> {
        self.sets
            .read()
            .get(&resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of observers on `resource`.
    pub fn observer_count(&self, resource: ResourceHandle) -> usize {
        self.sets.read().get(&resource).map_or(0, Vec::len)
    }

    /// Drop `resource`'s set entirely, returning what it held.
    ///
    /// Used when the resource handle is invalidated.
    pub fn remove_resource(&self, resource: ResourceHandle) -> Vec<ObserverEntry> {
        self.sets.write().remove(&resource).unwrap_or_default()
    }

    /// Resources that currently have at least one observer.
    pub fn observed_resources(&self) -> Vec<ResourceHandle> {
        self.sets.read().keys().copied().collect()
    }

    /// Receive a resource handle every time an observer is added to it.
    pub fn watch(&self) -> Receiver<ResourceHandle> {
        let (sender, receiver) = unbounded();
        self.watchers.lock().push(sender);
        receiver
    }

    fn wake_watchers(&self, resource: ResourceHandle) {
        self.watchers
            .lock()
            .retain(|watcher| watcher.send(resource).is_ok());
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
