//! Client-side presence subscriptions.

use super::{
    PresenceAnnouncement, PresenceCallback, PresenceConfig, PresenceEvent, PresenceHandle,
    PresenceRequest, PresenceUpdate,
};
use crate::dispatch::CallbackDispatch;
use crate::error::{PresenceError, Result};
use crate::lifecycle::LifecycleGuard;
use crate::types::{AsyncToken, DeviceId};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Percentages of the TTL at which a silent source is probed. Reaching the
/// last one without hearing from the source times the subscription out.
const PROBE_LEVELS: [u32; 5] = [50, 75, 85, 95, 100];

/// Liveness of one announcing host.
struct SourceTracker {
    sequence_number: u32,
    ttl: Duration,
    window_start: Instant,
    /// Index into `PROBE_LEVELS` of the next threshold to act on.
    level: usize,
}

impl SourceTracker {
    fn new(sequence_number: u32, max_age_secs: u32, now: Instant) -> Self {
        Self {
            sequence_number,
            ttl: Duration::from_secs(u64::from(max_age_secs)),
            window_start: now,
            level: 0,
        }
    }

    fn renew(&mut self, max_age_secs: u32, now: Instant) {
        self.ttl = Duration::from_secs(u64::from(max_age_secs));
        self.window_start = now;
        self.level = 0;
    }

    fn threshold(&self, level: usize) -> Instant {
        self.window_start + self.ttl * PROBE_LEVELS[level] / 100
    }
}

struct SinkInner {
    handle: PresenceHandle,
    request: PresenceRequest,
    callback: PresenceCallback,
    dispatch: CallbackDispatch,
    /// Assigned by the engine once the subscription is accepted.
    engine_token: Mutex<Option<AsyncToken>>,
    sources: Mutex<HashMap<String, SourceTracker>>,
    cancelled: AtomicBool,
}

/// Receives presence announcements from the engine for one subscription.
///
/// The engine calls [`deliver`](Self::deliver) from its own context; the
/// user callback always runs on a dispatch worker.
#[derive(Clone)]
pub struct PresenceSink {
    inner: Arc<SinkInner>,
}

impl PresenceSink {
    fn new(
        handle: PresenceHandle,
        request: PresenceRequest,
        callback: PresenceCallback,
        dispatch: CallbackDispatch,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                handle,
                request,
                callback,
                dispatch,
                engine_token: Mutex::new(None),
                sources: Mutex::new(HashMap::new()),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> PresenceHandle {
        self.inner.handle
    }

    pub fn request(&self) -> &PresenceRequest {
        &self.inner.request
    }

    fn engine_token(&self) -> Option<AsyncToken> {
        *self.inner.engine_token.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Feed one announcement received from `host`.
    pub fn deliver(&self, host: &str, announcement: PresenceAnnouncement) {
        self.deliver_at(host, announcement, Instant::now());
    }

    pub(crate) fn deliver_at(&self, host: &str, announcement: PresenceAnnouncement, now: Instant) {
        if self.is_cancelled() {
            debug!(%host, "presence for cancelled subscription dropped");
            return;
        }
        let request = &self.inner.request;
        if !request.is_multicast() && request.host != host {
            return;
        }
        if let Some(ids) = &request.device_ids {
            if !ids.contains(&announcement.device_id) {
                return;
            }
        }

        let event = {
            let mut sources = self.inner.sources.lock();
            if announcement.is_stop() {
                sources.remove(host);
                Some(PresenceEvent::Stopped)
            } else {
                match sources.get_mut(host) {
                    Some(tracker) if tracker.sequence_number == announcement.sequence_number => {
                        tracker.renew(announcement.max_age_secs, now);
                        None
                    }
                    Some(tracker) => {
                        tracker.sequence_number = announcement.sequence_number;
                        tracker.renew(announcement.max_age_secs, now);
                        Some(PresenceEvent::ResourceChanged {
                            resource_type: announcement.resource_type.clone(),
                            trigger: announcement.trigger,
                        })
                    }
                    None => {
                        sources.insert(
                            host.to_string(),
                            SourceTracker::new(
                                announcement.sequence_number,
                                announcement.max_age_secs,
                                now,
                            ),
                        );
                        Some(PresenceEvent::Started)
                    }
                }
            }
        };

        let Some(event) = event else {
            return;
        };
        if let (Some(wanted), Some(got)) = (&request.resource_type, &announcement.resource_type) {
            if wanted != got {
                return;
            }
        }
        self.emit(PresenceUpdate {
            handle: self.inner.handle,
            host: host.to_string(),
            device_id: Some(announcement.device_id),
            sequence_number: Some(announcement.sequence_number),
            event,
        });
    }

    /// Advance every TTL window to `now`.
    ///
    /// Returns how many probes are due. A source that reaches the end of its
    /// window is reported as timed out and forgotten.
    ///
    /// Multicast subscriptions only follow sequence numbers; they have no
    /// TTL window.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        if self.is_cancelled() || self.inner.request.is_multicast() {
            return 0;
        }
        let mut probes = 0;
        let mut timed_out = Vec::new();
        {
            let mut sources = self.inner.sources.lock();
            for (host, tracker) in sources.iter_mut() {
                while tracker.level < PROBE_LEVELS.len() && now >= tracker.threshold(tracker.level) {
                    tracker.level += 1;
                    if tracker.level == PROBE_LEVELS.len() {
                        timed_out.push(host.clone());
                    } else {
                        probes += 1;
                    }
                }
            }
            for host in &timed_out {
                sources.remove(host);
            }
        }

        for host in timed_out {
            info!(%host, "presence timed out");
            self.emit(PresenceUpdate {
                handle: self.inner.handle,
                host,
                device_id: None,
                sequence_number: None,
                event: PresenceEvent::TimedOut,
            });
        }
        probes
    }

    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    fn emit(&self, update: PresenceUpdate) {
        let callback = Arc::clone(&self.inner.callback);
        self.inner.dispatch.submit(move || callback(update));
    }
}

/// Drives the TTL windows of every subscription.
struct Watchdog {
    stop: Sender<()>,
    worker: JoinHandle<()>,
}

/// Follows remote servers' presence.
pub struct PresenceSubscriber {
    lifecycle: Arc<LifecycleGuard>,
    dispatch: CallbackDispatch,
    config: PresenceConfig,
    subscriptions: Arc<Mutex<HashMap<PresenceHandle, PresenceSink>>>,
    next_handle: AtomicU64,
    watchdog: Mutex<Option<Watchdog>>,
}

impl PresenceSubscriber {
    pub fn new(
        lifecycle: Arc<LifecycleGuard>,
        dispatch: CallbackDispatch,
        config: PresenceConfig,
    ) -> Self {
        Self {
            lifecycle,
            dispatch,
            config,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
            watchdog: Mutex::new(None),
        }
    }

    /// Follow `host`'s presence, optionally only for one resource type.
    ///
    /// An empty `host` follows every host that announces.
    pub fn subscribe<F>(
        &self,
        host: &str,
        resource_type: Option<&str>,
        callback: F,
    ) -> Result<PresenceHandle>
    where
        F: Fn(PresenceUpdate) + Send + Sync + 'static,
    {
        self.subscribe_request(
            PresenceRequest {
                host: host.to_string(),
                resource_type: resource_type.map(str::to_string),
                device_ids: None,
            },
            Arc::new(callback),
        )
    }

    /// Follow `host`'s presence for the listed devices only.
    pub fn subscribe_device_presence<F>(
        &self,
        host: &str,
        device_ids: Vec<DeviceId>,
        callback: F,
    ) -> Result<PresenceHandle>
    where
        F: Fn(PresenceUpdate) + Send + Sync + 'static,
    {
        if device_ids.is_empty() {
            return Err(PresenceError::InvalidParam(
                "device presence needs at least one device id".to_string(),
            ));
        }
        self.subscribe_request(
            PresenceRequest {
                host: host.to_string(),
                resource_type: None,
                device_ids: Some(device_ids),
            },
            Arc::new(callback),
        )
    }

    fn subscribe_request(
        &self,
        request: PresenceRequest,
        callback: PresenceCallback,
    ) -> Result<PresenceHandle> {
        let mode = self.lifecycle.mode();
        if !mode.has_client() {
            return Err(PresenceError::WrongMode {
                mode,
                needs: "client",
            });
        }
        self.ensure_watchdog()?;

        let handle = PresenceHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let sink = PresenceSink::new(handle, request.clone(), callback, self.dispatch.clone());

        let token = self.lifecycle.borrow_lock();
        let engine = token.resolve()?;
        let async_token = engine
            .subscribe_presence(request.clone(), sink.clone())
            .map_err(|e| PresenceError::SendFailed(e.to_string()))?;
        drop(engine);
        *sink.inner.engine_token.lock() = Some(async_token);

        debug!(host = %request.host, ?handle, "presence subscribed");
        self.subscriptions.lock().insert(handle, sink);
        Ok(handle)
    }

    /// Stop following. Updates already queued may still be delivered.
    ///
    /// The subscription is forgotten locally even if the engine is gone, in
    /// which case `LockUnavailable` is returned.
    pub fn unsubscribe(&self, handle: PresenceHandle) -> Result<()> {
        let sink = self
            .subscriptions
            .lock()
            .remove(&handle)
            .ok_or(PresenceError::UnknownHandle(handle.0))?;
        sink.cancel();

        let token = self.lifecycle.borrow_lock();
        let engine = token.resolve()?;
        if let Some(async_token) = sink.engine_token() {
            engine
                .cancel(async_token)
                .map_err(|e| PresenceError::SendFailed(e.to_string()))?;
        }
        debug!(?handle, "presence unsubscribed");
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Run one watchdog pass at `now`: send due probes and report timeouts.
    #[cfg(test)]
    pub(crate) fn sweep(&self, now: Instant) {
        sweep(&self.subscriptions, &self.lifecycle, now);
    }

    fn ensure_watchdog(&self) -> Result<()> {
        let mut watchdog = self.watchdog.lock();
        if watchdog.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(self.config.watchdog_interval());
        let subscriptions = Arc::clone(&self.subscriptions);
        let lifecycle = Arc::clone(&self.lifecycle);

        let worker = thread::Builder::new()
            .name("presence-watchdog".to_string())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => sweep(&subscriptions, &lifecycle, Instant::now()),
                }
            })?;

        *watchdog = Some(Watchdog {
            stop: stop_tx,
            worker,
        });
        Ok(())
    }
}

impl Drop for PresenceSubscriber {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            drop(watchdog.stop);
            let _ = watchdog.worker.join();
        }
    }
}

fn sweep(
    subscriptions: &Mutex<HashMap<PresenceHandle, PresenceSink>>,
    lifecycle: &LifecycleGuard,
    now: Instant,
) {
    let sinks: Vec<PresenceSink> = subscriptions.lock().values().cloned().collect();
    let due: Vec<(AsyncToken, usize)> = sinks
        .iter()
        .filter_map(|sink| {
            let probes = sink.expire(now);
            match sink.engine_token() {
                Some(async_token) if probes > 0 => Some((async_token, probes)),
                _ => None,
            }
        })
        .collect();
    if due.is_empty() {
        return;
    }

    let token = lifecycle.borrow_lock();
    let Ok(engine) = token.resolve() else {
        return;
    };
    for (async_token, probes) in due {
        for _ in 0..probes {
            if let Err(e) = engine.probe_presence(async_token) {
                warn!(token = ?async_token, error = %e, "presence probe failed");
            }
        }
    }
}
