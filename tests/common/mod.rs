//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use blebridge::config::session_config::SessionConfig;
use blebridge::core::bluetooth::backends::fake::FakeTransport;
use blebridge::core::bluetooth::{
    CharacteristicProperties, ConnectionState, HandleRange, RawCharacteristic, RawService, Session,
};
use uuid::Uuid;

pub const ADDRESS: &str = "C0:FF:EE:00:00:01";

pub fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_00805f9b34fb)
}

pub fn service(short: u16, start: u16, end: u16) -> RawService {
    RawService {
        uuid: uuid16(short),
        handle: start,
        range: Some(HandleRange::new(start, end)),
    }
}

pub fn characteristic(short: u16, handle: u16, flags: &[&str]) -> RawCharacteristic {
    RawCharacteristic {
        uuid: uuid16(short),
        handle,
        properties: CharacteristicProperties::from_flags(flags),
        service_handle: None,
    }
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        operation_timeout_secs: 2,
        discovery_timeout_secs: 2,
        ..Default::default()
    }
}

pub fn session(transport: Arc<FakeTransport>) -> Session {
    Session::new(transport, fast_config())
}

pub async fn connected(transport: Arc<FakeTransport>) -> Session {
    let session = session(transport);
    session
        .connect(ADDRESS, Duration::from_secs(1))
        .await
        .expect("fake connect");
    session
}

/// Waits until the session reports `state`, failing the test after a second.
pub async fn wait_for_state(session: &Session, state: ConnectionState) {
    let mut changes = session.state_changes();
    tokio::time::timeout(Duration::from_secs(1), changes.wait_for(|s| s.state == state))
        .await
        .expect("state change timed out")
        .expect("lifecycle dropped");
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
