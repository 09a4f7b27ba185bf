//! The protocol engine this subsystem coordinates around.
//!
//! Wire encoding, transports and the engine's own processing loop live
//! behind the [`Engine`] trait. Components reach an engine only through a
//! [`LockToken`](crate::lifecycle::LockToken), which serialises access and
//! fails once the engine has been torn down.

mod loopback;

pub use loopback::{LoopbackEngine, SentNotification};

use crate::directory::{DirectoryRequest, DirectoryResponse};
use crate::dispatch::Completion;
use crate::presence::{PresenceAnnouncement, PresenceRequest, PresenceSink};
use crate::router::EntityResponse;
use crate::types::{
    AsyncToken, Notification, ObserverEntry, QualityOfService, ResourceHandle, ServiceMode,
};
use thiserror::Error;

/// Failure reported by an engine primitive.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineFault(pub String);

impl EngineFault {
    pub fn new(message: impl Into<String>) -> Self {
        EngineFault(message.into())
    }
}

/// Result type for engine primitives.
pub type EngineResult<T> = std::result::Result<T, EngineFault>;

/// The single-threaded protocol engine, as seen by this subsystem.
///
/// The per-operation primitives are called with the engine's serialising
/// lock held, so an implementation never sees two of them at once. `start`,
/// `stop_client` and `stop_server` are called by the lifecycle guard without
/// that lock, at a point where no token can resolve. Asynchronous results are
/// reported later from the engine's own context through the [`Completion`]
/// or [`PresenceSink`] it was given.
pub trait Engine: Send + Sync {
    /// Initialise the engine in `mode`.
    fn start(&self, mode: ServiceMode) -> EngineResult<()>;

    /// Tear down the client half. Outstanding client requests must be
    /// completed or dropped.
    fn stop_client(&self) -> EngineResult<()>;

    /// Tear down the server half.
    fn stop_server(&self) -> EngineResult<()>;

    /// Send one observe notification to one observer.
    fn send_notification(
        &self,
        resource: ResourceHandle,
        observer: &ObserverEntry,
        notification: &Notification,
        qos: QualityOfService,
    ) -> EngineResult<()>;

    /// Send the response to an entity request.
    fn send_response(&self, response: EntityResponse) -> EngineResult<()>;

    /// Broadcast a presence announcement.
    fn send_presence(&self, announcement: &PresenceAnnouncement) -> EngineResult<()>;

    /// Issue a directory publish/delete. The engine must eventually complete
    /// or drop `completion`.
    fn issue_directory_rpc(
        &self,
        request: DirectoryRequest,
        completion: Completion<DirectoryResponse>,
    ) -> EngineResult<AsyncToken>;

    /// Start receiving presence announcements for `request` into `sink`.
    fn subscribe_presence(
        &self,
        request: PresenceRequest,
        sink: PresenceSink,
    ) -> EngineResult<AsyncToken>;

    /// Ask a presence source whether it is still alive.
    fn probe_presence(&self, token: AsyncToken) -> EngineResult<()>;

    /// Cancel an outstanding asynchronous operation.
    fn cancel(&self, token: AsyncToken) -> EngineResult<()>;
}
