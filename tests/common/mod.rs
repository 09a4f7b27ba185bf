//! Shared helpers for integration tests.
#![allow(dead_code)]

use resource_presence::{DeviceId, LoopbackEngine, Platform, PlatformConfig, ServiceMode};
use std::sync::Arc;

pub const LOCAL: &str = "coap://127.0.0.1:5683";
pub const DIRECTORY: &str = "coap://10.0.0.1:5683";

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn test_platform(mode: ServiceMode) -> (Arc<LoopbackEngine>, Platform) {
    init_tracing();
    let engine = Arc::new(LoopbackEngine::new(LOCAL));
    let config = PlatformConfig {
        mode,
        device_id: DeviceId::new("test-device"),
        ..Default::default()
    };
    let platform = Platform::new(config, engine.clone()).unwrap();
    (engine, platform)
}
