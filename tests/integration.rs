//! Integration tests for the presence subsystem.

mod common;

use common::{test_platform, DIRECTORY, LOCAL};
use crossbeam_channel::unbounded;
use resource_presence::{
    DirectoryLink, DirectoryLinks, DirectoryResponse, DirectoryRoot, EntityHandlerResult,
    EntityRequest, HandlerContext, Method, Notification, NotifyOutcome, ObserveAction,
    ObserverEntry, PeerAddress, PeriodicNotifier, PresenceEvent, PresenceTrigger,
    QualityOfService, Representation, RequestId, ResourceHandle, ResponseCode, RpcStatus,
    ServiceMode, DEFAULT_DIRECTORY_TTL_SECS,
};
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const THERMOMETER: ResourceHandle = ResourceHandle(11);

fn observe_request(id: u64, action: ObserveAction, observer: u32) -> EntityRequest {
    EntityRequest {
        id: RequestId(id),
        resource: THERMOMETER,
        method: Method::Get,
        observe: Some((
            action,
            ObserverEntry::new(observer, PeerAddress::ip("192.168.1.20", 5683)),
        )),
        payload: None,
    }
}

// --- Observation Workflow Tests ---

#[test]
fn test_observe_notify_unobserve_workflow() {
    let (engine, platform) = test_platform(ServiceMode::Server);
    platform.start().unwrap();

    let temperature = Arc::new(AtomicI64::new(20));
    let current = temperature.clone();
    platform.router().register_handler(
        THERMOMETER,
        move |_: &EntityRequest, _: &HandlerContext| {
            EntityHandlerResult::Ok(Some(Representation::new(
                json!({ "temperature": current.load(Ordering::SeqCst) }),
            )))
        },
    );

    // Client observes: initial GET answered, observer recorded
    platform
        .router()
        .dispatch(observe_request(1, ObserveAction::Register, 5))
        .unwrap();
    assert_eq!(engine.responses()[0].code, ResponseCode::Content);
    assert_eq!(platform.registry().observer_count(THERMOMETER), 1);

    // State changes reach the observer exactly once
    temperature.store(23, Ordering::SeqCst);
    let reading = Representation::new(json!({ "temperature": 23 }));
    let outcome = platform
        .notifier()
        .notify_all(THERMOMETER, &reading, QualityOfService::Medium)
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::Delivered { attempted: 1, failed: 0 });
    let sent = engine.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].notification, Notification::Update(reading.clone()));
    assert_eq!(sent[0].qos, QualityOfService::Medium);

    // Client cancels; further notifications find nobody
    platform
        .router()
        .dispatch(observe_request(2, ObserveAction::Unregister, 5))
        .unwrap();
    let outcome = platform
        .notifier()
        .notify_all(THERMOMETER, &reading, QualityOfService::Low)
        .unwrap();
    assert!(outcome.is_no_observers());
    assert_eq!(engine.notifications().len(), 1);

    platform.stop().unwrap();
}

#[test]
fn test_simulated_sensor_waits_for_observers() {
    let (engine, platform) = test_platform(ServiceMode::Server);
    platform.start().unwrap();

    let samples = Arc::new(AtomicI64::new(0));
    let counter = samples.clone();
    let sensor = PeriodicNotifier::spawn(
        platform.notifier().clone(),
        THERMOMETER,
        Duration::from_millis(10),
        QualityOfService::Low,
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Representation::new(json!({ "temperature": 20 + n }))
        },
    )
    .unwrap();

    thread::sleep(Duration::from_millis(80));
    assert_eq!(samples.load(Ordering::SeqCst), 1);
    assert!(engine.notifications().is_empty());

    platform.registry().register(
        THERMOMETER,
        ObserverEntry::new(1, PeerAddress::ip("192.168.1.20", 5683)),
    );
    thread::sleep(Duration::from_millis(100));
    assert!(engine.notifications().len() >= 2);

    sensor.stop();
    platform.stop().unwrap();
}

// --- Presence Workflow Tests ---

#[test]
fn test_presence_round_trip_through_loopback() {
    let (_engine, platform) = test_platform(ServiceMode::Both);
    platform.start().unwrap();

    let (tx, rx) = unbounded();
    platform
        .presence_subscriber()
        .subscribe(LOCAL, None, move |update| tx.send(update).unwrap())
        .unwrap();

    let state = platform.presence().start(0).unwrap();
    assert_eq!(state.ttl_secs, 60);
    let started = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(started.event, PresenceEvent::Started);
    assert_eq!(started.sequence_number, Some(state.sequence_number));
    assert_eq!(started.device_id, Some(platform.device_id().clone()));

    platform
        .presence()
        .announce_change("oic.r.temperature", PresenceTrigger::Change)
        .unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap().event,
        PresenceEvent::ResourceChanged {
            resource_type: Some("oic.r.temperature".to_string()),
            trigger: PresenceTrigger::Change,
        }
    );

    // The last stop announces "stopped" before the engine goes away
    platform.stop().unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap().event,
        PresenceEvent::Stopped
    );
}

#[test]
fn test_presence_ttl_normalisation() {
    let (engine, platform) = test_platform(ServiceMode::Server);
    platform.start().unwrap();

    assert_eq!(platform.presence().start(0).unwrap().ttl_secs, 60);
    assert_eq!(platform.presence().start(999_999).unwrap().ttl_secs, 86_400);
    assert_eq!(platform.presence().start(45).unwrap().ttl_secs, 45);

    let advertised: Vec<u32> = engine.presence_sent().iter().map(|a| a.max_age_secs).collect();
    assert_eq!(advertised, vec![60, 86_400, 45]);

    platform.stop().unwrap();
}

// --- Directory Workflow Tests ---

#[test]
fn test_publish_then_delete() {
    let (engine, platform) = test_platform(ServiceMode::Both);
    platform.start().unwrap();
    let (tx, rx) = unbounded();

    let published = tx.clone();
    let token = platform
        .directory()
        .publish(DIRECTORY, &[THERMOMETER], DEFAULT_DIRECTORY_TTL_SECS, move |response| {
            published.send(response.status).unwrap()
        })
        .unwrap();
    let (_, request) = engine.pending_directory()[0].clone();
    assert_eq!(request.ttl_secs, 86_400);
    assert_eq!(request.resources, vec![THERMOMETER]);

    engine.respond_directory(
        token,
        DirectoryResponse::published(DirectoryLinks {
            root: DirectoryRoot {
                href: "/oic/rd".to_string(),
                device_id: platform.device_id().clone(),
                ttl_secs: 86_400,
            },
            links: vec![DirectoryLink {
                href: "/a/thermometer".to_string(),
                resource_types: vec!["oic.r.temperature".to_string()],
                interfaces: vec!["oic.if.s".to_string()],
                instance: 3,
            }],
        }),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), RpcStatus::Changed);

    let token = platform
        .directory()
        .delete_resource(DIRECTORY, &[THERMOMETER], move |status| tx.send(status).unwrap())
        .unwrap();
    engine.respond_directory(token, DirectoryResponse::status(RpcStatus::Deleted));
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), RpcStatus::Deleted);

    platform.stop().unwrap();
}

#[test]
fn test_publish_then_stop_still_calls_back_once() {
    let (_engine, platform) = test_platform(ServiceMode::Both);
    platform.start().unwrap();
    let (tx, rx) = unbounded();

    platform
        .directory()
        .publish(DIRECTORY, &[THERMOMETER], 3600, move |response| {
            tx.send(response.status).unwrap()
        })
        .unwrap();
    platform.stop().unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), RpcStatus::Cancelled);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

// --- Lifecycle Tests ---

#[test]
fn test_nested_start_stop_keeps_engine_alive() {
    let (engine, platform) = test_platform(ServiceMode::Both);

    for _ in 0..5 {
        platform.start().unwrap();
    }
    for _ in 0..4 {
        platform.stop().unwrap();
    }
    assert!(engine.is_running());
    assert_eq!(engine.start_calls(), 1);

    // Components still reach the engine
    platform.registry().register(
        THERMOMETER,
        ObserverEntry::new(1, PeerAddress::ip("192.168.1.20", 5683)),
    );
    let outcome = platform
        .notifier()
        .notify_all(THERMOMETER, &Representation::empty(), QualityOfService::Low)
        .unwrap();
    assert!(!outcome.is_no_observers());
    assert_eq!(engine.notifications_sent(), 1);

    platform.stop().unwrap();
    assert!(!engine.is_running());
    assert_eq!(engine.teardown_order(), vec!["client", "server"]);
}
