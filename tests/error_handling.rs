//! Error handling and edge case tests.

mod common;

use common::{test_platform, DIRECTORY, LOCAL};
use proptest::prelude::*;
use resource_presence::{
    ObserverEntry, ObserverId, PeerAddress, PlatformConfig, PresenceError, QualityOfService,
    Representation, ResourceHandle, ServiceMode,
};
use std::time::Duration;

fn observer(id: u32) -> ObserverEntry {
    ObserverEntry::new(id, PeerAddress::ip("10.1.1.1", 5683))
}

// --- Lifecycle Errors ---

#[test]
fn test_stop_before_start() {
    let (engine, platform) = test_platform(ServiceMode::Both);

    assert!(matches!(platform.stop(), Err(PresenceError::NotStarted)));
    assert_eq!(engine.stop_calls(), (0, 0));
    assert!(!platform.is_running());
}

#[test]
fn test_engine_init_failure() {
    let (engine, platform) = test_platform(ServiceMode::Server);
    engine.fail_next_start("address in use");

    assert!(matches!(platform.start(), Err(PresenceError::EngineInit(_))));
    assert!(!platform.is_running());

    // A later attempt can still succeed
    platform.start().unwrap();
    assert!(platform.is_running());
    platform.stop().unwrap();
}

#[test]
fn test_client_teardown_failure_still_stops() {
    let (engine, platform) = test_platform(ServiceMode::Both);
    platform.start().unwrap();
    engine.fail_next_client_stop("pending exchange");

    assert!(matches!(platform.stop(), Err(PresenceError::EngineTeardown(_))));
    assert!(!platform.is_running());
    assert_eq!(engine.teardown_order(), vec!["client", "server"]);
}

#[test]
fn test_components_fail_fast_after_stop() {
    let (_engine, platform) = test_platform(ServiceMode::Both);
    platform.start().unwrap();
    platform.registry().register(ResourceHandle(1), observer(1));
    platform.stop().unwrap();

    assert!(matches!(
        platform.notifier().notify_all(ResourceHandle(1), &Representation::empty(), QualityOfService::Low),
        Err(PresenceError::LockUnavailable)
    ));
    assert!(matches!(platform.presence().start(0), Err(PresenceError::LockUnavailable)));
    assert!(matches!(
        platform.presence_subscriber().subscribe(LOCAL, None, |_| {}),
        Err(PresenceError::LockUnavailable)
    ));
    assert!(matches!(
        platform.directory().publish(DIRECTORY, &[ResourceHandle(1)], 60, |_| {}),
        Err(PresenceError::LockUnavailable)
    ));
}

#[test]
fn test_server_only_platform_refuses_client_requests() {
    let (engine, platform) = test_platform(ServiceMode::Server);
    platform.start().unwrap();

    assert!(matches!(
        platform.directory().publish(DIRECTORY, &[ResourceHandle(1)], 60, |_| {
            panic!("refused request called back")
        }),
        Err(PresenceError::WrongMode { mode: ServiceMode::Server, .. })
    ));
    assert!(matches!(
        platform.presence_subscriber().subscribe(LOCAL, None, |_| {}),
        Err(PresenceError::WrongMode { mode: ServiceMode::Server, .. })
    ));
    assert!(engine.pending_directory().is_empty());

    // Server-side presence still works
    platform.presence().start(0).unwrap();
    platform.stop().unwrap();
    assert!(engine.presence_sent().last().unwrap().is_stop());
}

// --- Parameter Errors ---

#[test]
fn test_empty_directory_host() {
    let (_engine, platform) = test_platform(ServiceMode::Client);
    platform.start().unwrap();

    assert!(matches!(
        platform.directory().publish("", &[ResourceHandle(1)], 60, |_| {}),
        Err(PresenceError::InvalidParam(_))
    ));
    assert!(matches!(
        platform.directory().delete_resource("", &[], |_| {}),
        Err(PresenceError::InvalidParam(_))
    ));
    platform.stop().unwrap();
}

#[test]
fn test_unknown_presence_handle() {
    let (_engine, platform) = test_platform(ServiceMode::Client);
    platform.start().unwrap();

    let handle = platform
        .presence_subscriber()
        .subscribe(LOCAL, None, |_| {})
        .unwrap();
    platform.presence_subscriber().unsubscribe(handle).unwrap();

    assert!(matches!(
        platform.presence_subscriber().unsubscribe(handle),
        Err(PresenceError::UnknownHandle(_))
    ));
    platform.stop().unwrap();
}

#[test]
fn test_rejected_subscription_is_not_kept() {
    let (engine, platform) = test_platform(ServiceMode::Client);
    platform.start().unwrap();
    engine.reject_next_rpc("too many subscriptions");

    assert!(matches!(
        platform.presence_subscriber().subscribe(LOCAL, None, |_| {}),
        Err(PresenceError::SendFailed(_))
    ));
    assert_eq!(platform.presence_subscriber().subscription_count(), 0);
    platform.stop().unwrap();
}

#[test]
fn test_invalid_config() {
    let result = PlatformConfig::from_json_str(r#"{ "presence": { "default_ttl_secs": 0 } }"#);
    assert!(matches!(result, Err(PresenceError::Config(_))));

    let result = PlatformConfig::from_json_str(r#"{ "device_id": "" }"#);
    assert!(matches!(result, Err(PresenceError::Config(_))));
}

#[test]
fn test_stop_during_refresh_is_clean() {
    let (engine, platform) = test_platform(ServiceMode::Server);
    platform.start().unwrap();
    platform.presence().start(1).unwrap();

    std::thread::sleep(Duration::from_millis(600));
    platform.stop().unwrap();

    let sent = engine.presence_sent();
    assert!(sent.len() >= 3, "expected create, refresh and stop: {:?}", sent);
    assert!(sent.last().unwrap().is_stop());
}

// --- Limits ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_notify_list_limit(count in 0usize..400) {
        let (engine, platform) = test_platform(ServiceMode::Server);
        platform.start().unwrap();
        let sensor = ResourceHandle(3);
        for id in 0..count as u32 {
            platform.registry().register(sensor, observer(id));
        }

        let ids: Vec<ObserverId> = (0..count as u32).map(ObserverId).collect();
        let result = platform
            .notifier()
            .notify_list(sensor, &ids, &Representation::empty(), QualityOfService::Low);

        if count > 255 {
            let rejected = matches!(result, Err(PresenceError::TooManyObservers { .. }));
            prop_assert!(rejected);
            prop_assert!(engine.notifications().is_empty());
        } else if count == 0 {
            prop_assert!(result.unwrap().is_no_observers());
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(engine.notifications().len(), count);
        }
        platform.stop().unwrap();
    }

    #[test]
    fn prop_publish_limit(count in 0u64..400) {
        let (engine, platform) = test_platform(ServiceMode::Client);
        platform.start().unwrap();
        let handles: Vec<ResourceHandle> = (0..count).map(ResourceHandle).collect();

        let result = platform.directory().publish(DIRECTORY, &handles, 60, |_| {});

        if count > 255 {
            let rejected = matches!(result, Err(PresenceError::TooManyResources { .. }));
            prop_assert!(rejected);
            prop_assert!(engine.pending_directory().is_empty());
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(engine.pending_directory().len(), 1);
        }
        platform.stop().unwrap();
    }
}
