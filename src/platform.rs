//! Platform struct tying all components to one engine.

use crate::directory::DirectoryPublisher;
use crate::dispatch::{CallbackDispatch, DispatchConfig};
use crate::engine::Engine;
use crate::error::{PresenceError, Result};
use crate::lifecycle::LifecycleGuard;
use crate::notify::NotificationDispatcher;
use crate::presence::{PresenceAnnouncer, PresenceConfig, PresenceSubscriber};
use crate::registry::SubscriptionRegistry;
use crate::router::RequestRouter;
use crate::types::{DeviceId, ServiceMode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Platform configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Which halves of the engine to run.
    pub mode: ServiceMode,

    /// Identity announced in presence and directory entries.
    pub device_id: DeviceId,

    /// Callback worker pool.
    pub dispatch: DispatchConfig,

    /// Presence TTLs and watchdog cadence.
    pub presence: PresenceConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            mode: ServiceMode::Both,
            device_id: DeviceId::new(format!("{:032x}", rand::random::<u128>())),
            dispatch: DispatchConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl PlatformConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PlatformConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.0.is_empty() {
            return Err(PresenceError::Config("device_id is empty".to_string()));
        }
        if self.dispatch.workers == 0 {
            return Err(PresenceError::Config(
                "dispatch.workers must be at least 1".to_string(),
            ));
        }
        if self.presence.default_ttl_secs == 0
            || self.presence.default_ttl_secs > self.presence.max_ttl_secs
        {
            return Err(PresenceError::Config(format!(
                "presence.default_ttl_secs must be in 1..={}",
                self.presence.max_ttl_secs
            )));
        }
        Ok(())
    }
}

/// One observation/presence/directory stack around one engine.
///
/// Every component shares the same [`LifecycleGuard`], so all of them lose
/// access to the engine together when the last `stop` tears it down.
pub struct Platform {
    config: PlatformConfig,
    lifecycle: Arc<LifecycleGuard>,
    dispatch: CallbackDispatch,
    notifier: NotificationDispatcher,
    router: RequestRouter,
    announcer: PresenceAnnouncer,
    subscriber: PresenceSubscriber,
    directory: DirectoryPublisher,
}

impl Platform {
    /// Wire a platform around `engine`. The engine is not started.
    pub fn new(config: PlatformConfig, engine: Arc<dyn Engine>) -> Result<Self> {
        config.validate()?;

        let lifecycle = Arc::new(LifecycleGuard::new(engine, config.mode));
        let dispatch = CallbackDispatch::new(&config.dispatch);
        let registry = Arc::new(SubscriptionRegistry::new());
        let notifier = NotificationDispatcher::new(registry, Arc::clone(&lifecycle));
        let router = RequestRouter::new(notifier.clone(), Arc::clone(&lifecycle), dispatch.clone());
        let announcer = PresenceAnnouncer::new(
            Arc::clone(&lifecycle),
            config.presence.clone(),
            config.device_id.clone(),
        );
        let subscriber = PresenceSubscriber::new(
            Arc::clone(&lifecycle),
            dispatch.clone(),
            config.presence.clone(),
        );
        let directory = DirectoryPublisher::new(Arc::clone(&lifecycle), dispatch.clone());

        info!(device = %config.device_id, mode = ?config.mode, "platform created");
        Ok(Self {
            config,
            lifecycle,
            dispatch,
            notifier,
            router,
            announcer,
            subscriber,
            directory,
        })
    }

    /// Start the platform. Only the first outstanding start initialises the
    /// engine.
    pub fn start(&self) -> Result<()> {
        self.lifecycle.start()
    }

    /// Undo one `start`. The last one stops presence and tears the engine
    /// down.
    pub fn stop(&self) -> Result<()> {
        self.lifecycle.stop_with(|| {
            if let Err(e) = self.announcer.stop() {
                warn!(error = %e, "final presence announcement not sent");
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleGuard> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.notifier.registry()
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn presence(&self) -> &PresenceAnnouncer {
        &self.announcer
    }

    pub fn presence_subscriber(&self) -> &PresenceSubscriber {
        &self.subscriber
    }

    pub fn directory(&self) -> &DirectoryPublisher {
        &self.directory
    }

    pub fn dispatch(&self) -> &CallbackDispatch {
        &self.dispatch
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        // Queued callbacks still run; later completions fall back to
        // detached threads.
        self.dispatch.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;

    #[test]
    fn test_config_from_json_defaults() {
        let config = PlatformConfig::from_json_str(
            r#"{ "mode": "server", "device_id": "thermostat-3", "presence": { "default_ttl_secs": 30 } }"#,
        )
        .unwrap();

        assert_eq!(config.mode, ServiceMode::Server);
        assert_eq!(config.device_id, DeviceId::new("thermostat-3"));
        assert_eq!(config.presence.default_ttl_secs, 30);
        assert_eq!(config.presence.max_ttl_secs, 86_400);
        assert_eq!(config.dispatch.workers, 4);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(
            PlatformConfig::from_json_str(r#"{ "dispatch": { "workers": 0 } }"#),
            Err(PresenceError::Config(_))
        ));
        assert!(matches!(
            PlatformConfig::from_json_str(r#"{ "mode": "sideways" }"#),
            Err(PresenceError::Config(_))
        ));
        assert!(matches!(
            PlatformConfig::from_json_str("not json"),
            Err(PresenceError::Config(_))
        ));
    }

    #[test]
    fn test_default_device_ids_differ() {
        assert_ne!(
            PlatformConfig::default().device_id,
            PlatformConfig::default().device_id
        );
    }

    #[test]
    fn test_last_stop_ends_presence() {
        let engine = Arc::new(LoopbackEngine::new("coap://127.0.0.1:5683"));
        let platform = Platform::new(PlatformConfig::default(), engine.clone()).unwrap();

        platform.start().unwrap();
        platform.start().unwrap();
        platform.presence().start(0).unwrap();

        platform.stop().unwrap();
        assert!(platform.presence().is_active());

        platform.stop().unwrap();
        assert!(!platform.presence().is_active());
        assert!(!engine.is_running());
        let sent = engine.presence_sent();
        assert!(sent.last().unwrap().is_stop());
    }

    #[test]
    fn test_concurrent_stops_send_one_farewell() {
        for _ in 0..20 {
            let engine = Arc::new(LoopbackEngine::new("coap://127.0.0.1:5683"));
            let platform = Platform::new(PlatformConfig::default(), engine.clone()).unwrap();
            platform.start().unwrap();
            platform.start().unwrap();
            platform.presence().start(0).unwrap();

            std::thread::scope(|scope| {
                scope.spawn(|| platform.stop().unwrap());
                scope.spawn(|| platform.stop().unwrap());
            });

            assert!(!engine.is_running());
            let farewells = engine.presence_sent().iter().filter(|a| a.is_stop()).count();
            assert_eq!(farewells, 1);
        }
    }
}
