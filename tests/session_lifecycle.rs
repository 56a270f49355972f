//! Integration tests for connect / discover / disconnect against the
//! scripted transport.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blebridge::core::bluetooth::backends::fake::{ConnectBehavior, FakeCall, FakeTransport};
use blebridge::core::bluetooth::{
    Capabilities, CharacteristicRef, ConnectionState, TransportEvent, UUID_BATTERY_LEVEL,
    UUID_DEVICE_NAME,
};
use blebridge::BleError;

use common::*;

#[tokio::test]
async fn test_get_services_is_resolved_once() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;

    let first = session.get_services().await.unwrap();
    let second = session.get_services().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(transport.calls().discover_services, 1);
    assert_eq!(transport.calls().discover_characteristics, 1);

    assert_eq!(first.services().len(), 2);
    let battery = first.characteristic_by_handle(12).unwrap();
    assert_eq!(battery.uuid, UUID_BATTERY_LEVEL);
    assert_eq!(battery.service_handle, 10);
    assert_eq!(battery.descriptors.len(), 1);
}

#[tokio::test]
async fn test_reads_by_handle_uuid_and_characteristic() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;

    assert_eq!(session.read_characteristic(12u16).await.unwrap(), vec![87]);
    assert_eq!(
        session.read_characteristic(UUID_DEVICE_NAME).await.unwrap(),
        b"Fake Peripheral".to_vec()
    );
    let tree = session.get_services().await.unwrap();
    let battery = tree.characteristic_by_handle(12).unwrap();
    assert_eq!(session.read_characteristic(battery).await.unwrap(), vec![87]);

    assert!(matches!(
        session.read_characteristic(CharacteristicRef::Handle(99)).await,
        Err(BleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_operations_after_disconnect_fail_fast() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    session.get_services().await.unwrap();

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    let reads_before = transport.calls().read;
    assert_eq!(session.read_characteristic(12u16).await, Err(BleError::NotConnected));
    assert_eq!(session.get_services().await.err(), Some(BleError::NotConnected));
    assert_eq!(transport.calls().read, reads_before);

    // A second disconnect is a no-op.
    session.disconnect().await.unwrap();
    assert_eq!(transport.calls().disconnect, 1);
}

#[tokio::test]
async fn test_hanging_connect_times_out_and_cancels() {
    let transport = Arc::new(FakeTransport::demo());
    transport.set_connect_behavior(ConnectBehavior::Hang);
    let session = session(transport.clone());

    let result = session.connect(ADDRESS, Duration::from_millis(100)).await;
    assert_eq!(result, Err(BleError::Timeout));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    // The pending native connect was cancelled.
    assert_eq!(transport.calls().disconnect, 1);

    transport.set_connect_behavior(ConnectBehavior::Succeed);
    session.connect(ADDRESS, Duration::from_secs(1)).await.unwrap();
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_failed_connect_returns_to_disconnected() {
    let transport = Arc::new(FakeTransport::demo());
    transport.set_connect_behavior(ConnectBehavior::Fail(BleError::Connection(
        "page timeout".to_string(),
    )));
    let session = session(transport.clone());

    let result = session.connect(ADDRESS, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(BleError::Connection(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(transport.connected_to().is_none());
}

#[tokio::test]
async fn test_connect_to_same_address_is_idempotent() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    session.connect(ADDRESS, Duration::from_secs(1)).await.unwrap();
    assert_eq!(transport.calls().connect, 1);

    let other = session
        .connect("C0:FF:EE:00:00:99", Duration::from_secs(1))
        .await;
    assert!(matches!(other, Err(BleError::Connection(_))));
    assert_eq!(session.address().as_deref(), Some(ADDRESS));
}

#[tokio::test]
async fn test_user_disconnect_racing_peer_drop_cleans_up_once() {
    let transport = Arc::new(FakeTransport::demo());
    transport.set_disconnect_delay(Duration::from_millis(50));
    let session = connected(transport.clone()).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    session.set_disconnected_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let user = {
        let session = session.clone();
        tokio::spawn(async move { session.disconnect().await })
    };
    transport.drop_link();
    user.await.unwrap().unwrap();

    wait_for_state(&session, ConnectionState::Disconnected).await;
    settle().await;
    assert_eq!(transport.calls().disconnect, 1);
    assert!(fired.load(Ordering::SeqCst) <= 1);
}

#[tokio::test]
async fn test_peer_drop_runs_disconnected_callback() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    session.get_services().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.set_disconnected_callback(move |address: &str| {
        sink.lock().unwrap().push(address.to_string());
    });

    assert!(transport.drop_link());
    wait_for_state(&session, ConnectionState::Disconnected).await;
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![ADDRESS.to_string()]);
    assert_eq!(transport.calls().disconnect, 1);
    assert_eq!(session.read_characteristic(12u16).await, Err(BleError::NotConnected));
}

#[tokio::test]
async fn test_user_disconnect_does_not_run_disconnected_callback() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    session.set_disconnected_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.disconnect().await.unwrap();
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_native_disconnect_still_disconnects() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    transport.fail_next(FakeCall::Disconnect, BleError::Connection("stack busy".to_string()));

    let result = session.disconnect().await;
    assert!(matches!(result, Err(BleError::Connection(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    session.connect(ADDRESS, Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_services_changed_mid_discovery_restarts_it() {
    let transport = Arc::new(FakeTransport::demo());
    transport.churn_services(1);
    transport.set_discovery_delay(Duration::from_millis(20));
    let session = connected(transport.clone()).await;

    let tree = session.get_services().await.unwrap();
    assert_eq!(tree.services().len(), 2);
    assert_eq!(transport.calls().discover_services, 2);
}

#[tokio::test]
async fn test_discovery_gives_up_when_services_keep_changing() {
    let transport = Arc::new(FakeTransport::demo());
    transport.churn_services(10);
    transport.set_discovery_delay(Duration::from_millis(20));
    let session = connected(transport.clone()).await;

    let result = session.get_services().await;
    assert!(matches!(result, Err(BleError::Discovery(_))));
    assert_eq!(
        transport.calls().discover_services as u32,
        session.config().max_discovery_attempts
    );
}

#[tokio::test]
async fn test_services_changed_after_resolve_invalidates_tree() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    let before = session.get_services().await.unwrap();

    transport.replace_gatt(
        vec![service(0x180a, 1, 5)],
        vec![characteristic(0x2a29, 3, &["read"])],
        Vec::new(),
    );
    assert!(transport.push(TransportEvent::ServicesChanged));
    settle().await;

    let after = session.get_services().await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.services().len(), 1);
    assert_eq!(transport.calls().discover_services, 2);
}

#[tokio::test]
async fn test_orphan_characteristic_is_reported_not_fatal() {
    let transport = Arc::new(FakeTransport::new().with_gatt(
        vec![service(0x180f, 10, 20)],
        vec![characteristic(0x2a19, 25, &["read"])],
        Vec::new(),
    ));
    let session = connected(transport.clone()).await;

    let tree = session.get_services().await.unwrap();
    assert!(tree.services()[0].characteristics.is_empty());
    assert_eq!(tree.orphans().len(), 1);
    assert_eq!(tree.orphans()[0].handle, 25);
}

#[tokio::test]
async fn test_write_kind_follows_characteristic_properties() {
    let transport = Arc::new(FakeTransport::new().with_gatt(
        vec![service(0xfff0, 1, 20)],
        vec![
            characteristic(0xfff1, 3, &["write"]),
            characteristic(0xfff2, 5, &["write-without-response"]),
            characteristic(0xfff3, 7, &["write", "write-without-response"]),
            characteristic(0xfff4, 9, &["read"]),
        ],
        Vec::new(),
    ));
    let session = connected(transport.clone()).await;

    session.write_characteristic(3u16, &[1], false).await.unwrap();
    session.write_characteristic(5u16, &[2], true).await.unwrap();
    session.write_characteristic(7u16, &[3], false).await.unwrap();
    session.write_characteristic(7u16, &[4], true).await.unwrap();
    assert_eq!(
        transport.writes(),
        vec![
            (3, vec![1], true),
            (5, vec![2], false),
            (7, vec![3], false),
            (7, vec![4], true),
        ]
    );

    assert!(matches!(
        session.write_characteristic(9u16, &[5], true).await,
        Err(BleError::NotSupported(_))
    ));
}

#[tokio::test]
async fn test_write_without_response_needs_transport_support() {
    let transport = Arc::new(
        FakeTransport::new()
            .with_capabilities(Capabilities {
                descriptors: true,
                notifications: true,
                write_without_response: false,
            })
            .with_gatt(
                vec![service(0xfff0, 1, 20)],
                vec![characteristic(0xfff2, 5, &["write-without-response"])],
                Vec::new(),
            ),
    );
    let session = connected(transport.clone()).await;
    assert!(matches!(
        session.write_characteristic(5u16, &[1], false).await,
        Err(BleError::NotSupported(_))
    ));
    assert!(transport.writes().is_empty());
}

#[tokio::test]
async fn test_descriptor_read_and_write() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;

    assert_eq!(session.read_descriptor(13).await.unwrap(), vec![0, 0]);
    session.write_descriptor(13, &[1, 0]).await.unwrap();
    assert_eq!(session.read_descriptor(13).await.unwrap(), vec![1, 0]);
    assert!(matches!(session.read_descriptor(99).await, Err(BleError::NotFound(_))));
}

#[tokio::test]
async fn test_descriptors_unsupported_without_capability() {
    let transport = Arc::new(FakeTransport::demo().with_capabilities(Capabilities {
        descriptors: false,
        notifications: true,
        write_without_response: true,
    }));
    let session = connected(transport.clone()).await;
    assert!(matches!(session.read_descriptor(13).await, Err(BleError::NotSupported(_))));
    assert_eq!(transport.calls().discover_descriptors, 0);
}

#[tokio::test]
async fn test_failed_read_surfaces_and_keeps_the_link() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    transport.fail_next(FakeCall::Read, BleError::Gatt("insufficient authentication".to_string()));

    assert!(matches!(session.read_characteristic(12u16).await, Err(BleError::Gatt(_))));
    assert!(session.is_connected());
    assert_eq!(session.read_characteristic(12u16).await.unwrap(), vec![87]);
}

#[tokio::test]
async fn test_dropping_a_connected_session_releases_the_link() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    drop(session);
    settle().await;
    assert_eq!(transport.calls().disconnect, 1);
    assert!(transport.connected_to().is_none());
}

#[tokio::test]
async fn test_failed_discovery_leaves_tree_unresolved_and_retries() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;

    transport.fail_next(FakeCall::DiscoverServices, BleError::Gatt("status 7".to_string()));
    assert!(matches!(session.get_services().await, Err(BleError::Discovery(_))));
    assert!(session.is_connected());

    transport.fail_next(FakeCall::DiscoverCharacteristics, BleError::Gatt("status 7".to_string()));
    assert!(matches!(session.get_services().await, Err(BleError::Discovery(_))));

    let tree = session.get_services().await.unwrap();
    assert_eq!(tree.services().len(), 2);
    assert_eq!(transport.calls().discover_services, 3);
}

#[tokio::test]
async fn test_failed_descriptor_discovery_degrades_to_no_descriptors() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    transport.fail_next(FakeCall::DiscoverDescriptors, BleError::Gatt("status 5".to_string()));

    let tree = session.get_services().await.unwrap();
    let battery = tree.characteristic_by_handle(12).unwrap();
    assert!(battery.descriptors.is_empty());
    assert!(tree.descriptor_by_handle(13).is_none());
    assert_eq!(transport.calls().discover_descriptors, 1);
}

#[tokio::test]
async fn test_discovery_in_flight_aborts_when_link_drops() {
    let transport = Arc::new(FakeTransport::demo());
    transport.set_discovery_delay(Duration::from_secs(10));
    let session = connected(transport.clone()).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.get_services().await })
    };
    settle().await;
    transport.drop_link();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("discovery should abort well before its delay")
        .unwrap();
    assert_eq!(result.err(), Some(BleError::NotConnected));
    wait_for_state(&session, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn test_read_in_flight_aborts_when_link_drops() {
    let transport = Arc::new(FakeTransport::demo());
    let session = connected(transport.clone()).await;
    session.get_services().await.unwrap();
    transport.set_read_delay(Duration::from_secs(10));

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.read_characteristic(12u16).await })
    };
    settle().await;
    transport.drop_link();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("read should abort well before its delay")
        .unwrap();
    assert_eq!(result, Err(BleError::NotConnected));
}
