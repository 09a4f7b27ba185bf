//! # Resource Presence
//!
//! Observation, presence and resource-directory publication around a
//! single-threaded IoT protocol engine.
//!
//! ## Core Concepts
//!
//! - **Lifecycle**: Reference-counted engine start/stop, and the token every
//!   component uses to reach the engine
//! - **Observation**: Per-resource observer sets and notification fan-out
//! - **Presence**: TTL-bounded liveness broadcasts and subscriptions to them
//! - **Directory**: Asynchronous publish/delete of resources to a remote
//!   resource directory
//!
//! ## Example
//!
//! ```ignore
//! use resource_presence::{LoopbackEngine, Platform, PlatformConfig, QualityOfService};
//!
//! let engine = Arc::new(LoopbackEngine::new("coap://127.0.0.1:5683"));
//! let platform = Platform::new(PlatformConfig::default(), engine)?;
//! platform.start()?;
//!
//! // Announce presence with the default TTL
//! platform.presence().start(0)?;
//!
//! // Tell observers about a new reading
//! platform.notifier().notify_all(sensor, &reading, QualityOfService::Low)?;
//!
//! // Publish to a resource directory
//! platform.directory().publish("coap://10.0.0.1:5683", &[sensor], 86_400, |response| {
//!     println!("published: {:?}", response.status);
//! })?;
//!
//! platform.stop()?;
//! ```

pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod platform;
pub mod presence;
pub mod registry;
pub mod router;
pub mod types;

// Re-exports
pub use directory::{
    DirectoryLink, DirectoryLinks, DirectoryOperation, DirectoryPublisher, DirectoryRequest,
    DirectoryResponse, DirectoryRoot, DEFAULT_DIRECTORY_TTL_SECS,
};
pub use dispatch::{Abandon, CallbackDispatch, Completion, DispatchConfig, PendingRpc};
pub use engine::{Engine, EngineFault, EngineResult, LoopbackEngine, SentNotification};
pub use error::{PresenceError, Result};
pub use lifecycle::{EngineAccess, LifecycleGuard, LockToken};
pub use notify::{NotificationDispatcher, NotifyOutcome, PeriodicNotifier};
pub use platform::{Platform, PlatformConfig};
pub use presence::{
    PresenceAnnouncement, PresenceAnnouncer, PresenceCallback, PresenceConfig, PresenceEvent,
    PresenceHandle, PresenceRequest, PresenceSink, PresenceState, PresenceSubscriber,
    PresenceTrigger, PresenceUpdate, DEFAULT_PRESENCE_TTL_SECS, MAX_PRESENCE_TTL_SECS,
};
pub use registry::SubscriptionRegistry;
pub use router::{
    EntityHandler, EntityHandlerResult, EntityRequest, EntityResponse, HandlerContext, Method,
    RequestId, RequestRouter, ResponseCode,
};
pub use types::*;
