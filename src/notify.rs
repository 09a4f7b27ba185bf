//! Notification fan-out to observers.

use crate::error::{PresenceError, Result};
use crate::lifecycle::LifecycleGuard;
use crate::registry::SubscriptionRegistry;
use crate::types::{
    Notification, ObserverEntry, ObserverId, QualityOfService, Representation, ResourceHandle,
    MAX_OBSERVERS_PER_NOTIFICATION,
};
use crossbeam_channel::{bounded, select, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a notification call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Sends were attempted; `failed` of them were rejected by the transport.
    Delivered { attempted: usize, failed: usize },
    /// Nobody is observing. Periodic drivers should suspend until an
    /// observer registers.
    NoObservers,
}

impl NotifyOutcome {
    pub fn is_no_observers(&self) -> bool {
        matches!(self, NotifyOutcome::NoObservers)
    }
}

/// Sends a resource's state to its observers.
#[derive(Clone)]
pub struct NotificationDispatcher {
    registry: Arc<SubscriptionRegistry>,
    lifecycle: Arc<LifecycleGuard>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, lifecycle: Arc<LifecycleGuard>) -> Self {
        Self {
            registry,
            lifecycle,
        }
    }

    /// Send `representation` to every observer of `resource`.
    pub fn notify_all(
        &self,
        resource: ResourceHandle,
        representation: &Representation,
        qos: QualityOfService,
    ) -> Result<NotifyOutcome> {
        let observers = self.registry.observers(resource);
        if observers.is_empty() {
            return Ok(NotifyOutcome::NoObservers);
        }
        let notification = Notification::Update(representation.clone());
        self.send(resource, &observers, &notification, qos)
    }

    /// Send `representation` to the listed observers of `resource`.
    ///
    /// At most [`MAX_OBSERVERS_PER_NOTIFICATION`] ids may be given. Ids that
    /// are not registered on `resource` are skipped.
    pub fn notify_list(
        &self,
        resource: ResourceHandle,
        observer_ids: &[ObserverId],
        representation: &Representation,
        qos: QualityOfService,
    ) -> Result<NotifyOutcome> {
        if observer_ids.len() > MAX_OBSERVERS_PER_NOTIFICATION {
            return Err(PresenceError::TooManyObservers {
                count: observer_ids.len(),
                max: MAX_OBSERVERS_PER_NOTIFICATION,
            });
        }

        let mut targets = self.registry.observers(resource);
        targets.retain(|o| observer_ids.contains(&o.id));
        if targets.is_empty() {
            return Ok(NotifyOutcome::NoObservers);
        }
        let notification = Notification::Update(representation.clone());
        self.send(resource, &targets, &notification, qos)
    }

    /// Tell every observer of `resource` that it is gone, then drop the set.
    ///
    /// Returns the number of observers told.
    pub fn notify_deleted(&self, resource: ResourceHandle) -> Result<usize> {
        let observers = self.registry.remove_resource(resource);
        if observers.is_empty() {
            return Ok(0);
        }
        self.send(resource, &observers, &Notification::Deleted, QualityOfService::High)?;
        Ok(observers.len())
    }

    /// One attempt per observer, no retry.
    fn send(
        &self,
        resource: ResourceHandle,
        observers: &[ObserverEntry],
        notification: &Notification,
        qos: QualityOfService,
    ) -> Result<NotifyOutcome> {
        let token = self.lifecycle.borrow_lock();
        let engine = token.resolve()?;

        let mut failed = 0;
        for observer in observers {
            if let Err(e) = engine.send_notification(resource, observer, notification, qos) {
                warn!(%resource, observer = ?observer.id, error = %e, "notification send failed");
                failed += 1;
            }
        }
        debug!(%resource, attempted = observers.len(), failed, "notification sent");

        Ok(NotifyOutcome::Delivered {
            attempted: observers.len(),
            failed,
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }
}

/// Drives periodic state changes of one resource, like a sensor sampling
/// loop.
///
/// Each tick produces a new representation and notifies every observer.
/// When nobody is observing the driver suspends until an observer registers,
/// instead of producing state nobody will read.
pub struct PeriodicNotifier {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl PeriodicNotifier {
    /// Start driving `resource`, calling `produce` every `interval`.
    pub fn spawn<F>(
        dispatcher: NotificationDispatcher,
        resource: ResourceHandle,
        interval: Duration,
        qos: QualityOfService,
        mut produce: F,
    ) -> Result<Self>
    where
        F: FnMut() -> Representation + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let wake = dispatcher.registry().watch();

        let worker = thread::Builder::new()
            .name(format!("periodic-notify-{}", resource))
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    default(interval) => {}
                }

                // Registrations up to here are visible to notify_all.
                while wake.try_recv().is_ok() {}

                let representation = produce();
                match dispatcher.notify_all(resource, &representation, qos) {
                    Ok(NotifyOutcome::Delivered { .. }) => {}
                    Ok(NotifyOutcome::NoObservers) => {
                        debug!(%resource, "no observers, suspending periodic notification");
                        loop {
                            select! {
                                recv(stop_rx) -> _ => return,
                                recv(wake) -> woken => match woken {
                                    Ok(handle) if handle == resource => break,
                                    Ok(_) => continue,
                                    Err(_) => return,
                                },
                            }
                        }
                        debug!(%resource, "observer registered, resuming periodic notification");
                    }
                    Err(PresenceError::LockUnavailable) => {
                        info!(%resource, "engine gone, periodic notification ends");
                        break;
                    }
                    Err(e) => warn!(%resource, error = %e, "periodic notification failed"),
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            worker: Some(worker),
        })
    }

    /// Stop driving and wait for the worker to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PeriodicNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
