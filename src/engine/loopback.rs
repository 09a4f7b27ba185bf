//! In-process engine that records everything it is asked to do.
//!
//! Nothing leaves the process: notifications, responses and presence
//! broadcasts are kept for inspection, directory requests wait until
//! [`LoopbackEngine::respond_directory`] answers them, and
//! [`LoopbackEngine::announce`] injects presence as if it had arrived from
//! the network. Failures can be scripted per call.

use super::{Engine, EngineFault, EngineResult};
use crate::directory::{DirectoryRequest, DirectoryResponse};
use crate::dispatch::Completion;
use crate::presence::{PresenceAnnouncement, PresenceRequest, PresenceSink};
use crate::router::EntityResponse;
use crate::types::{
    AsyncToken, Notification, ObserverEntry, ObserverId, QualityOfService, ResourceHandle,
    ServiceMode,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// One notification the engine was asked to send.
#[derive(Clone, Debug, PartialEq)]
pub struct SentNotification {
    pub resource: ResourceHandle,
    pub observer: ObserverId,
    pub notification: Notification,
    pub qos: QualityOfService,
}

struct PendingDirectory {
    token: AsyncToken,
    request: DirectoryRequest,
    completion: Completion<DirectoryResponse>,
}

#[derive(Default)]
struct Faults {
    start: Option<String>,
    client_stop: Option<String>,
    server_stop: Option<String>,
    rpc: Option<String>,
    observers: HashSet<ObserverId>,
}

#[derive(Default)]
struct LoopbackState {
    mode: Option<ServiceMode>,
    start_calls: usize,
    client_stops: usize,
    server_stops: usize,
    teardown_order: Vec<&'static str>,
    faults: Faults,
    next_token: u64,
    /// Keep sent notifications for inspection; off for long runs.
    discard_notifications: bool,
    notifications_sent: usize,
    notifications: Vec<SentNotification>,
    responses: Vec<EntityResponse>,
    presence_sent: Vec<PresenceAnnouncement>,
    directory: Vec<PendingDirectory>,
    presence_sinks: HashMap<AsyncToken, PresenceSink>,
    probes: Vec<AsyncToken>,
    cancelled: Vec<AsyncToken>,
}

impl LoopbackState {
    fn issue_token(&mut self) -> AsyncToken {
        self.next_token += 1;
        AsyncToken(self.next_token)
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.mode.is_some() {
            Ok(())
        } else {
            Err(EngineFault::new("engine not running"))
        }
    }
}

/// Engine that loops everything back into the process.
pub struct LoopbackEngine {
    /// Address this engine's own presence broadcasts appear to come from.
    local_host: String,
    state: Mutex<LoopbackState>,
}

impl LoopbackEngine {
    pub fn new(local_host: impl Into<String>) -> Self {
        Self {
            local_host: local_host.into(),
            state: Mutex::new(LoopbackState::default()),
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().mode.is_some()
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    /// `(client, server)` teardown counts.
    pub fn stop_calls(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.client_stops, state.server_stops)
    }

    pub fn teardown_order(&self) -> Vec<&'static str> {
        self.state.lock().teardown_order.clone()
    }

    pub fn fail_next_start(&self, message: &str) {
        self.state.lock().faults.start = Some(message.to_string());
    }

    pub fn fail_next_client_stop(&self, message: &str) {
        self.state.lock().faults.client_stop = Some(message.to_string());
    }

    pub fn fail_next_server_stop(&self, message: &str) {
        self.state.lock().faults.server_stop = Some(message.to_string());
    }

    /// Reject the next directory or presence request synchronously.
    pub fn reject_next_rpc(&self, message: &str) {
        self.state.lock().faults.rpc = Some(message.to_string());
    }

    /// Every notification to `observer` fails from now on.
    pub fn fail_sends_to(&self, observer: ObserverId) {
        self.state.lock().faults.observers.insert(observer);
    }

    pub fn notifications(&self) -> Vec<SentNotification> {
        self.state.lock().notifications.clone()
    }

    /// Total notifications sent, including discarded ones.
    pub fn notifications_sent(&self) -> usize {
        self.state.lock().notifications_sent
    }

    /// Count notifications without keeping them.
    pub fn discard_notifications(&self) {
        let mut state = self.state.lock();
        state.discard_notifications = true;
        state.notifications.clear();
    }

    pub fn responses(&self) -> Vec<EntityResponse> {
        self.state.lock().responses.clone()
    }

    pub fn presence_sent(&self) -> Vec<PresenceAnnouncement> {
        self.state.lock().presence_sent.clone()
    }

    pub fn probes(&self) -> Vec<AsyncToken> {
        self.state.lock().probes.clone()
    }

    pub fn cancelled(&self) -> Vec<AsyncToken> {
        self.state.lock().cancelled.clone()
    }

    /// Directory requests still waiting for an answer.
    pub fn pending_directory(&self) -> Vec<(AsyncToken, DirectoryRequest)> {
        self.state
            .lock()
            .directory
            .iter()
            .map(|p| (p.token, p.request.clone()))
            .collect()
    }

    /// Answer a pending directory request. Returns false if `token` is not
    /// pending.
    pub fn respond_directory(&self, token: AsyncToken, response: DirectoryResponse) -> bool {
        let pending = {
            let mut state = self.state.lock();
            match state.directory.iter().position(|p| p.token == token) {
                Some(index) => state.directory.remove(index),
                None => return false,
            }
        };
        debug!(?token, status = ?response.status, "directory response");
        pending.completion.complete(response);
        true
    }

    /// Deliver `announcement` to every presence subscription, as if it had
    /// been received from `host`.
    pub fn announce(&self, host: &str, announcement: PresenceAnnouncement) {
        let sinks: Vec<PresenceSink> = self.state.lock().presence_sinks.values().cloned().collect();
        trace!(%host, sinks = sinks.len(), "presence received");
        for sink in sinks {
            sink.deliver(host, announcement.clone());
        }
    }
}

impl Engine for LoopbackEngine {
    fn start(&self, mode: ServiceMode) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.faults.start.take() {
            return Err(EngineFault(message));
        }
        state.start_calls += 1;
        state.mode = Some(mode);
        Ok(())
    }

    fn stop_client(&self) -> EngineResult<()> {
        let (directory, sinks) = {
            let mut state = self.state.lock();
            state.client_stops += 1;
            state.teardown_order.push("client");
            if !state.mode.is_some_and(|m| m.has_server()) {
                state.mode = None;
            }
            (
                std::mem::take(&mut state.directory),
                std::mem::take(&mut state.presence_sinks),
            )
        };
        if !directory.is_empty() {
            debug!(count = directory.len(), "dropping outstanding directory requests");
        }
        drop(directory);
        drop(sinks);

        let mut state = self.state.lock();
        match state.faults.client_stop.take() {
            Some(message) => Err(EngineFault(message)),
            None => Ok(()),
        }
    }

    fn stop_server(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.server_stops += 1;
        state.teardown_order.push("server");
        state.mode = None;
        match state.faults.server_stop.take() {
            Some(message) => Err(EngineFault(message)),
            None => Ok(()),
        }
    }

    fn send_notification(
        &self,
        resource: ResourceHandle,
        observer: &ObserverEntry,
        notification: &Notification,
        qos: QualityOfService,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ensure_running()?;
        if state.faults.observers.contains(&observer.id) {
            return Err(EngineFault::new(format!("{} unreachable", observer.peer)));
        }
        state.notifications_sent += 1;
        if !state.discard_notifications {
            state.notifications.push(SentNotification {
                resource,
                observer: observer.id,
                notification: notification.clone(),
                qos,
            });
        }
        Ok(())
    }

    fn send_response(&self, response: EntityResponse) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ensure_running()?;
        state.responses.push(response);
        Ok(())
    }

    fn send_presence(&self, announcement: &PresenceAnnouncement) -> EngineResult<()> {
        let sinks: Vec<PresenceSink> = {
            let mut state = self.state.lock();
            state.ensure_running()?;
            state.presence_sent.push(announcement.clone());
            state.presence_sinks.values().cloned().collect()
        };
        for sink in sinks {
            sink.deliver(&self.local_host, announcement.clone());
        }
        Ok(())
    }

    fn issue_directory_rpc(
        &self,
        request: DirectoryRequest,
        completion: Completion<DirectoryResponse>,
    ) -> EngineResult<AsyncToken> {
        let mut state = self.state.lock();
        state.ensure_running()?;
        if let Some(message) = state.faults.rpc.take() {
            return Err(EngineFault(message));
        }
        let token = state.issue_token();
        state.directory.push(PendingDirectory {
            token,
            request,
            completion,
        });
        Ok(token)
    }

    fn subscribe_presence(
        &self,
        request: PresenceRequest,
        sink: PresenceSink,
    ) -> EngineResult<AsyncToken> {
        let mut state = self.state.lock();
        state.ensure_running()?;
        if let Some(message) = state.faults.rpc.take() {
            return Err(EngineFault(message));
        }
        let token = state.issue_token();
        debug!(host = %request.host, ?token, "presence subscription");
        state.presence_sinks.insert(token, sink);
        Ok(token)
    }

    fn probe_presence(&self, token: AsyncToken) -> EngineResult<()> {
        let mut state = self.state.lock();
        if !state.presence_sinks.contains_key(&token) {
            return Err(EngineFault::new(format!("no presence subscription {:?}", token)));
        }
        state.probes.push(token);
        Ok(())
    }

    fn cancel(&self, token: AsyncToken) -> EngineResult<()> {
        let (sink, pending) = {
            let mut state = self.state.lock();
            state.cancelled.push(token);
            let sink = state.presence_sinks.remove(&token);
            let pending = state
                .directory
                .iter()
                .position(|p| p.token == token)
                .map(|index| state.directory.remove(index));
            (sink, pending)
        };
        if sink.is_none() && pending.is_none() {
            return Err(EngineFault::new(format!("unknown token {:?}", token)));
        }
        Ok(())
    }
}
