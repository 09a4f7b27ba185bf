//! Presence: TTL-bounded liveness broadcasts.
//!
//! A server runs a [`PresenceAnnouncer`] to tell the network that its
//! resources are available, changing, or going away. Clients use a
//! [`PresenceSubscriber`] to follow those announcements for a given host.
//!
//! Each announcement carries a sequence number that changes whenever the
//! server's presence changes. A repeated sequence number only renews the
//! subscriber's TTL window; a `max_age_secs` of zero means the server has
//! stopped announcing.

mod announcer;
mod subscriber;

pub use announcer::{PresenceAnnouncer, PresenceState};
pub use subscriber::{PresenceSink, PresenceSubscriber};

use crate::types::DeviceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// TTL used when a caller asks for zero.
pub const DEFAULT_PRESENCE_TTL_SECS: u32 = 60;

/// Longest TTL an announcer will advertise (one day).
pub const MAX_PRESENCE_TTL_SECS: u32 = 60 * 60 * 24;

/// Presence tuning.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Substituted for a requested TTL of zero.
    pub default_ttl_secs: u32,
    /// Requested TTLs above this are clamped.
    pub max_ttl_secs: u32,
    /// How often subscribers check their TTL windows.
    pub watchdog_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_PRESENCE_TTL_SECS,
            max_ttl_secs: MAX_PRESENCE_TTL_SECS,
            watchdog_interval_ms: 250,
        }
    }
}

impl PresenceConfig {
    /// Effective TTL for a requested value. Never rejects.
    pub fn effective_ttl(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.default_ttl_secs
        } else {
            requested.min(self.max_ttl_secs)
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }
}

/// Why an announcement was sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceTrigger {
    Create,
    Change,
    Delete,
}

/// One presence broadcast, as sent by a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    pub device_id: DeviceId,
    /// Resource type that changed, if the announcement is about one.
    pub resource_type: Option<String>,
    pub trigger: PresenceTrigger,
    pub sequence_number: u32,
    /// Seconds the announcement stays valid; zero means "stopped".
    pub max_age_secs: u32,
}

impl PresenceAnnouncement {
    pub fn is_stop(&self) -> bool {
        self.max_age_secs == 0
    }
}

/// A presence subscription as handed to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceRequest {
    /// Host to follow; empty means every host (multicast).
    pub host: String,
    pub resource_type: Option<String>,
    pub device_ids: Option<Vec<DeviceId>>,
}

impl PresenceRequest {
    pub fn is_multicast(&self) -> bool {
        self.host.is_empty()
    }
}

/// Identifies one presence subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PresenceHandle(pub u64);

/// What happened to a followed server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceEvent {
    /// First announcement seen (or first after a stop/timeout).
    Started,
    /// The server's resources changed.
    ResourceChanged {
        resource_type: Option<String>,
        trigger: PresenceTrigger,
    },
    /// The server announced that it stopped.
    Stopped,
    /// No announcement arrived within the TTL window.
    TimedOut,
}

/// Delivered to a presence callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub handle: PresenceHandle,
    /// Host the announcement came from.
    pub host: String,
    pub device_id: Option<DeviceId>,
    pub sequence_number: Option<u32>,
    pub event: PresenceEvent,
}

/// User callback receiving presence updates.
pub type PresenceCallback = Arc<dyn Fn(PresenceUpdate) + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_ttl() {
        let config = PresenceConfig::default();
        assert_eq!(config.effective_ttl(0), 60);
        assert_eq!(config.effective_ttl(30), 30);
        assert_eq!(config.effective_ttl(999_999), MAX_PRESENCE_TTL_SECS);
        assert_eq!(config.effective_ttl(MAX_PRESENCE_TTL_SECS), MAX_PRESENCE_TTL_SECS);
    }
}
