//! Server-side presence announcement.

use super::{PresenceAnnouncement, PresenceConfig, PresenceTrigger};
use crate::error::{PresenceError, Result};
use crate::lifecycle::LifecycleGuard;
use crate::types::DeviceId;
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Snapshot of an active announcer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceState {
    pub ttl_secs: u32,
    pub sequence_number: u32,
}

/// Periodic re-announcement worker.
struct RefreshTimer {
    stop: Sender<()>,
    worker: JoinHandle<()>,
}

impl RefreshTimer {
    fn cancel(self) {
        drop(self.stop);
        let _ = self.worker.join();
    }
}

/// Announces this server's presence while active.
///
/// `Inactive --start--> Active --stop--> Inactive`. Starting while active
/// restarts the TTL window with the new TTL.
pub struct PresenceAnnouncer {
    lifecycle: Arc<LifecycleGuard>,
    config: PresenceConfig,
    device_id: DeviceId,
    /// The announcement currently being repeated, if active.
    current: Arc<Mutex<Option<PresenceAnnouncement>>>,
    timer: Mutex<Option<RefreshTimer>>,
    /// Serialises start/stop/change.
    transition: Mutex<()>,
}

impl PresenceAnnouncer {
    pub fn new(lifecycle: Arc<LifecycleGuard>, config: PresenceConfig, device_id: DeviceId) -> Self {
        Self {
            lifecycle,
            config,
            device_id,
            current: Arc::new(Mutex::new(None)),
            timer: Mutex::new(None),
            transition: Mutex::new(()),
        }
    }

    /// Start (or restart) announcing with `ttl_secs`.
    ///
    /// Zero selects the configured default; values above the maximum are
    /// clamped. Returns the effective state.
    pub fn start(&self, ttl_secs: u32) -> Result<PresenceState> {
        let _transition = self.transition.lock();
        let ttl = self.config.effective_ttl(ttl_secs);
        if ttl != ttl_secs {
            debug!(requested = ttl_secs, effective = ttl, "presence ttl adjusted");
        }

        let previous = self.current.lock().as_ref().map(|a| a.sequence_number);
        let announcement = PresenceAnnouncement {
            device_id: self.device_id.clone(),
            resource_type: None,
            trigger: PresenceTrigger::Create,
            sequence_number: fresh_sequence(previous),
            max_age_secs: ttl,
        };
        self.send(&announcement)?;

        self.cancel_timer();
        *self.current.lock() = Some(announcement.clone());
        self.spawn_timer(ttl)?;

        info!(ttl, sequence = announcement.sequence_number, "presence started");
        Ok(PresenceState {
            ttl_secs: ttl,
            sequence_number: announcement.sequence_number,
        })
    }

    /// Stop announcing. Idempotent.
    ///
    /// The announcer is inactive afterwards even if the final "stopped"
    /// announcement could not be sent.
    pub fn stop(&self) -> Result<()> {
        let _transition = self.transition.lock();
        let Some(last) = self.current.lock().take() else {
            return Ok(());
        };
        self.cancel_timer();

        let farewell = PresenceAnnouncement {
            device_id: self.device_id.clone(),
            resource_type: None,
            trigger: PresenceTrigger::Delete,
            sequence_number: fresh_sequence(Some(last.sequence_number)),
            max_age_secs: 0,
        };
        info!("presence stopped");
        self.send(&farewell)
    }

    /// Announce a change to one of this server's resources.
    ///
    /// Returns false without sending if presence is not active.
    pub fn announce_change(
        &self,
        resource_type: impl Into<String>,
        trigger: PresenceTrigger,
    ) -> Result<bool> {
        let _transition = self.transition.lock();
        let announcement = {
            let mut current = self.current.lock();
            let Some(active) = current.as_mut() else {
                return Ok(false);
            };
            active.sequence_number = fresh_sequence(Some(active.sequence_number));
            active.resource_type = Some(resource_type.into());
            active.trigger = trigger;
            active.clone()
        };
        debug!(resource_type = ?announcement.resource_type, ?trigger, "presence change");
        self.send(&announcement)?;
        Ok(true)
    }

    /// Current state, or `None` when inactive.
    pub fn state(&self) -> Option<PresenceState> {
        self.current.lock().as_ref().map(|a| PresenceState {
            ttl_secs: a.max_age_secs,
            sequence_number: a.sequence_number,
        })
    }

    pub fn is_active(&self) -> bool {
        self.current.lock().is_some()
    }

    fn send(&self, announcement: &PresenceAnnouncement) -> Result<()> {
        let token = self.lifecycle.borrow_lock();
        let engine = token.resolve()?;
        engine
            .send_presence(announcement)
            .map_err(|e| PresenceError::SendFailed(e.to_string()))
    }

    fn cancel_timer(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    /// Repeat the current announcement every half TTL.
    fn spawn_timer(&self, ttl_secs: u32) -> Result<()> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(Duration::from_secs(u64::from(ttl_secs)) / 2);
        let current = Arc::clone(&self.current);
        let lifecycle = Arc::clone(&self.lifecycle);

        let worker = thread::Builder::new()
            .name("presence-refresh".to_string())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(announcement) = current.lock().clone() else {
                            break;
                        };
                        let token = lifecycle.borrow_lock();
                        let sent = match token.resolve() {
                            Ok(engine) => engine.send_presence(&announcement),
                            Err(_) => {
                                debug!("engine gone, presence refresh ends");
                                break;
                            }
                        };
                        if let Err(e) = sent {
                            warn!(error = %e, "presence refresh failed");
                        }
                    },
                }
            })?;

        *self.timer.lock() = Some(RefreshTimer {
            stop: stop_tx,
            worker,
        });
        Ok(())
    }
}

impl Drop for PresenceAnnouncer {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// A random sequence number different from `previous`.
fn fresh_sequence(previous: Option<u32>) -> u32 {
    loop {
        let candidate = rand::random::<u32>();
        if Some(candidate) != previous {
            return candidate;
        }
    }
}
