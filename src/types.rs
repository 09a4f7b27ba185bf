//! Core types shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest observer list a single notification may address.
///
/// The count travels as one byte on the wire.
pub const MAX_OBSERVERS_PER_NOTIFICATION: usize = u8::MAX as usize;

/// Largest resource list a single directory request may carry.
pub const MAX_RESOURCES_PER_DIRECTORY_REQUEST: usize = u8::MAX as usize;

/// Opaque identity of a server-side resource, issued by the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceHandle(pub u64);

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHandle({})", self.0)
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one observation on one resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub u32);

impl fmt::Debug for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObserverId({})", self.0)
    }
}

/// Token identifying an asynchronous engine operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct AsyncToken(pub u64);

/// Connectivity adapter a peer is reachable through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adapter {
    #[default]
    Ip,
    Tcp,
    Ble,
}

/// Where a remote peer can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub adapter: Adapter,
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn ip(host: impl Into<String>, port: u16) -> Self {
        Self {
            adapter: Adapter::Ip,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.adapter {
            Adapter::Tcp => write!(f, "coap+tcp://{}:{}", self.host, self.port),
            Adapter::Ip | Adapter::Ble => write!(f, "coap://{}:{}", self.host, self.port),
        }
    }
}

/// A remote peer observing a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverEntry {
    pub id: ObserverId,
    pub peer: PeerAddress,
}

impl ObserverEntry {
    pub fn new(id: u32, peer: PeerAddress) -> Self {
        Self {
            id: ObserverId(id),
            peer,
        }
    }
}

/// Observe option carried alongside a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserveAction {
    Register,
    Unregister,
}

/// Delivery guarantee requested from the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    /// Non-confirmable.
    #[default]
    Low,
    Medium,
    /// Confirmable.
    High,
}

/// Which halves of the engine a platform runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    Server,
    Client,
    #[default]
    Both,
}

impl ServiceMode {
    pub fn has_server(self) -> bool {
        matches!(self, ServiceMode::Server | ServiceMode::Both)
    }

    pub fn has_client(self) -> bool {
        matches!(self, ServiceMode::Client | ServiceMode::Both)
    }
}

/// Current state of a resource, as sent to observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Representation(pub serde_json::Value);

impl Representation {
    pub fn new(value: serde_json::Value) -> Self {
        Representation(value)
    }

    pub fn empty() -> Self {
        Representation(serde_json::Value::Object(Default::default()))
    }
}

/// What an observer is told.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// The resource changed; carries its new representation.
    Update(Representation),
    /// The resource was unregistered; the observation ends.
    Deleted,
}

/// Terminal status of an asynchronous RPC, delivered to its callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcStatus {
    Ok,
    Created,
    Changed,
    Deleted,
    /// Remote rejection, surfaced verbatim.
    Rejected(u16),
    /// Synthesized by the transport when no response arrived.
    Timeout,
    /// The request was dropped before completing (engine torn down).
    Cancelled,
}

impl RpcStatus {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            RpcStatus::Ok | RpcStatus::Created | RpcStatus::Changed | RpcStatus::Deleted
        )
    }
}

/// Identity of the device hosting a set of resources.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
