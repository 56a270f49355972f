//! Scripted in-memory transport and scanner.
//!
//! Used by the test suites and by the demo binary when no real stack is
//! compiled in. Every native call is counted; tests can inject push events,
//! make connects hang, and fail individual calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_CLIENT_CHARACTERISTIC_CONFIG,
    UUID_DEVICE_NAME, UUID_GENERIC_ACCESS_SERVICE,
};
use crate::core::bluetooth::transport::{
    Capabilities, DisconnectReason, EventSender, HandleRange, RawCharacteristic, RawDescriptor,
    RawService, ScanSink, ScanTransport, Transport, TransportEvent,
};
use crate::core::bluetooth::types::{CharacteristicProperties, RawSighting, ScanEvent};
use crate::error::{BleError, Result};

/// Native calls a test can fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    ReadDescriptor,
    WriteDescriptor,
}

/// How `connect` behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail(BleError),
    /// Never acknowledges
    Hang,
}

/// Snapshot of the native call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub disconnect: usize,
    pub discover_services: usize,
    pub discover_characteristics: usize,
    pub discover_descriptors: usize,
    pub read: usize,
    pub write: usize,
    pub subscribe: usize,
    pub unsubscribe: usize,
}

#[derive(Default)]
struct Counters {
    connect: AtomicUsize,
    disconnect: AtomicUsize,
    discover_services: AtomicUsize,
    discover_characteristics: AtomicUsize,
    discover_descriptors: AtomicUsize,
    read: AtomicUsize,
    write: AtomicUsize,
    subscribe: AtomicUsize,
    unsubscribe: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

struct FakeState {
    services: Vec<RawService>,
    characteristics: Vec<RawCharacteristic>,
    descriptors: Vec<RawDescriptor>,
    values: HashMap<u16, Vec<u8>>,
    events: Option<EventSender>,
    connected_to: Option<String>,
    connect_behavior: ConnectBehavior,
    failures: HashMap<FakeCall, BleError>,
    writes: Vec<(u16, Vec<u8>, bool)>,
    subscribed: HashSet<u16>,
    /// Remaining discovery passes that announce a services change mid-flight
    churn_discoveries: usize,
    discovery_delay: Option<Duration>,
    read_delay: Option<Duration>,
    disconnect_delay: Option<Duration>,
}

pub struct FakeTransport {
    capabilities: Capabilities,
    state: Mutex<FakeState>,
    counters: Counters,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// An empty peripheral with every capability.
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities {
                descriptors: true,
                notifications: true,
                write_without_response: true,
            },
            state: Mutex::new(FakeState {
                services: Vec::new(),
                characteristics: Vec::new(),
                descriptors: Vec::new(),
                values: HashMap::new(),
                events: None,
                connected_to: None,
                connect_behavior: ConnectBehavior::Succeed,
                failures: HashMap::new(),
                writes: Vec::new(),
                subscribed: HashSet::new(),
                churn_discoveries: 0,
                discovery_delay: None,
                read_delay: None,
                disconnect_delay: None,
            }),
            counters: Counters::default(),
        }
    }

    /// A small peripheral: Generic Access with a device name, and Battery
    /// with a notifying level characteristic and its CCCD.
    pub fn demo() -> Self {
        Self::new()
            .with_gatt(
                vec![
                    RawService {
                        uuid: UUID_GENERIC_ACCESS_SERVICE,
                        handle: 1,
                        range: Some(HandleRange::new(1, 9)),
                    },
                    RawService {
                        uuid: UUID_BATTERY_SERVICE,
                        handle: 10,
                        range: Some(HandleRange::new(10, 20)),
                    },
                ],
                vec![
                    RawCharacteristic {
                        uuid: UUID_DEVICE_NAME,
                        handle: 3,
                        properties: CharacteristicProperties::from_flags(&["read"]),
                        service_handle: None,
                    },
                    RawCharacteristic {
                        uuid: UUID_BATTERY_LEVEL,
                        handle: 12,
                        properties: CharacteristicProperties::from_flags(&["read", "notify"]),
                        service_handle: None,
                    },
                ],
                vec![RawDescriptor {
                    uuid: UUID_CLIENT_CHARACTERISTIC_CONFIG,
                    handle: 13,
                    characteristic_handle: None,
                }],
            )
            .with_value(3, b"Fake Peripheral".to_vec())
            .with_value(12, vec![87])
            .with_value(13, vec![0, 0])
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_gatt(
        self,
        services: Vec<RawService>,
        characteristics: Vec<RawCharacteristic>,
        descriptors: Vec<RawDescriptor>,
    ) -> Self {
        {
            let mut state = self.state();
            state.services = services;
            state.characteristics = characteristics;
            state.descriptors = descriptors;
        }
        self
    }

    pub fn with_value(self, handle: u16, value: Vec<u8>) -> Self {
        self.state().values.insert(handle, value);
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state().connect_behavior = behavior;
    }

    /// Fails the next call of kind `call` with `error`.
    pub fn fail_next(&self, call: FakeCall, error: BleError) {
        self.state().failures.insert(call, error);
    }

    /// The next `count` discovery passes push a services-changed event
    /// while they run.
    pub fn churn_services(&self, count: usize) {
        self.state().churn_discoveries = count;
    }

    pub fn set_discovery_delay(&self, delay: Duration) {
        self.state().discovery_delay = Some(delay);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = Some(delay);
    }

    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.state().disconnect_delay = Some(delay);
    }

    /// Replaces the peripheral's attribute table, as a firmware update would.
    pub fn replace_gatt(
        &self,
        services: Vec<RawService>,
        characteristics: Vec<RawCharacteristic>,
        descriptors: Vec<RawDescriptor>,
    ) {
        let mut state = self.state();
        state.services = services;
        state.characteristics = characteristics;
        state.descriptors = descriptors;
    }

    /// Pushes an event as the native stack would. False when no connection
    /// is open or the event was dropped.
    pub fn push(&self, event: TransportEvent) -> bool {
        let events = self.state().events.clone();
        match events {
            Some(events) => events.push(event),
            None => false,
        }
    }

    pub fn notify(&self, handle: u16, value: &[u8]) -> bool {
        self.push(TransportEvent::Notification {
            handle,
            value: value.to_vec(),
        })
    }

    /// Simulates the peer dropping the link.
    pub fn drop_link(&self) -> bool {
        self.push(TransportEvent::Disconnected(DisconnectReason::Peer))
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            connect: c.connect.load(Ordering::SeqCst),
            disconnect: c.disconnect.load(Ordering::SeqCst),
            discover_services: c.discover_services.load(Ordering::SeqCst),
            discover_characteristics: c.discover_characteristics.load(Ordering::SeqCst),
            discover_descriptors: c.discover_descriptors.load(Ordering::SeqCst),
            read: c.read.load(Ordering::SeqCst),
            write: c.write.load(Ordering::SeqCst),
            subscribe: c.subscribe.load(Ordering::SeqCst),
            unsubscribe: c.unsubscribe.load(Ordering::SeqCst),
        }
    }

    /// Every write as `(handle, data, with_response)`.
    pub fn writes(&self) -> Vec<(u16, Vec<u8>, bool)> {
        self.state().writes.clone()
    }

    pub fn is_subscribed(&self, handle: u16) -> bool {
        self.state().subscribed.contains(&handle)
    }

    pub fn connected_to(&self) -> Option<String> {
        self.state().connected_to.clone()
    }

    fn take_failure(&self, call: FakeCall) -> Result<()> {
        match self.state().failures.remove(&call) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn require_link(&self) -> Result<()> {
        if self.state().connected_to.is_some() {
            Ok(())
        } else {
            Err(BleError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&self, address: &str, events: EventSender) -> Result<()> {
        bump(&self.counters.connect);
        self.take_failure(FakeCall::Connect)?;
        let behavior = self.state().connect_behavior.clone();
        match behavior {
            ConnectBehavior::Succeed => {
                let mut state = self.state();
                state.events = Some(events);
                state.connected_to = Some(address.to_string());
                info!("Fake link to {} established", address);
                Ok(())
            }
            ConnectBehavior::Fail(error) => Err(error),
            ConnectBehavior::Hang => {
                // Keep the sender alive like a stack that is still trying.
                self.state().events = Some(events);
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        bump(&self.counters.disconnect);
        let delay = self.state().disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.state();
            state.events = None;
            state.subscribed.clear();
            if let Some(address) = state.connected_to.take() {
                debug!("Fake link to {} released", address);
            }
        }
        self.take_failure(FakeCall::Disconnect)
    }

    async fn discover_services(&self) -> Result<Vec<RawService>> {
        bump(&self.counters.discover_services);
        self.take_failure(FakeCall::DiscoverServices)?;
        self.require_link()?;
        let churn = {
            let mut state = self.state();
            let churn = state.churn_discoveries > 0;
            if churn {
                state.churn_discoveries -= 1;
            }
            churn
        };
        if churn {
            self.push(TransportEvent::ServicesChanged);
        }
        Ok(self.state().services.clone())
    }

    async fn discover_characteristics(&self) -> Result<Vec<RawCharacteristic>> {
        bump(&self.counters.discover_characteristics);
        self.take_failure(FakeCall::DiscoverCharacteristics)?;
        self.require_link()?;
        let delay = self.state().discovery_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state().characteristics.clone())
    }

    async fn discover_descriptors(&self) -> Result<Vec<RawDescriptor>> {
        bump(&self.counters.discover_descriptors);
        self.take_failure(FakeCall::DiscoverDescriptors)?;
        self.require_link()?;
        Ok(self.state().descriptors.clone())
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        bump(&self.counters.read);
        self.take_failure(FakeCall::Read)?;
        self.require_link()?;
        let delay = self.state().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state().values.get(&handle).cloned().unwrap_or_default())
    }

    async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        bump(&self.counters.write);
        self.take_failure(FakeCall::Write)?;
        self.require_link()?;
        let mut state = self.state();
        state.values.insert(handle, data.to_vec());
        state.writes.push((handle, data.to_vec(), with_response));
        Ok(())
    }

    async fn subscribe(&self, handle: u16) -> Result<()> {
        bump(&self.counters.subscribe);
        self.take_failure(FakeCall::Subscribe)?;
        self.require_link()?;
        self.state().subscribed.insert(handle);
        Ok(())
    }

    async fn unsubscribe(&self, handle: u16) -> Result<()> {
        bump(&self.counters.unsubscribe);
        self.take_failure(FakeCall::Unsubscribe)?;
        self.require_link()?;
        self.state().subscribed.remove(&handle);
        Ok(())
    }

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        self.take_failure(FakeCall::ReadDescriptor)?;
        self.require_link()?;
        Ok(self.state().values.get(&handle).cloned().unwrap_or_default())
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        self.take_failure(FakeCall::WriteDescriptor)?;
        self.require_link()?;
        self.state().values.insert(handle, data.to_vec());
        Ok(())
    }
}

/// Scripted scan transport.
pub struct FakeScanner {
    sink: Mutex<Option<ScanSink>>,
    /// Sightings replayed on every `start_scan`
    script: Vec<RawSighting>,
    fail_start: Mutex<Option<BleError>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl Default for FakeScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeScanner {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            script: Vec::new(),
            fail_start: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn with_script(mut self, script: Vec<RawSighting>) -> Self {
        self.script = script;
        self
    }

    /// A few advertisers, including one that only reveals its name on a
    /// later sighting.
    pub fn demo() -> Self {
        let mut battery = RawSighting::for_address("C0:FF:EE:00:00:01");
        battery.rssi = Some(-58);
        battery.service_uuids = Some(vec![UUID_BATTERY_SERVICE]);

        let mut named = RawSighting::for_address("C0:FF:EE:00:00:01");
        named.name = Some("Fake Peripheral".to_string());
        named.rssi = Some(-55);

        let mut beacon = RawSighting::for_address("C0:FF:EE:00:00:02");
        beacon.rssi = Some(-80);
        beacon.manufacturer_data = Some(HashMap::from([(0x004c, vec![0x02, 0x15])]));
        beacon.service_data = Some(HashMap::from([(
            Uuid::from_u128(0x0000feaa_0000_1000_8000_00805f9b34fb),
            vec![0x10, 0x00],
        )]));

        Self::new().with_script(vec![battery, beacon, named])
    }

    fn sink(&self) -> MutexGuard<'_, Option<ScanSink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next_start(&self, error: BleError) {
        *self.fail_start.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Delivers a sighting as the native stack would. False when not scanning.
    pub fn emit(&self, sighting: RawSighting) -> bool {
        match self.sink().as_ref() {
            Some(sink) => sink.push(ScanEvent::Sighting(sighting)),
            None => false,
        }
    }

    pub fn remove(&self, address: &str) -> bool {
        match self.sink().as_ref() {
            Some(sink) => sink.push(ScanEvent::Removed(address.to_string())),
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.sink().is_some()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanTransport for FakeScanner {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start_scan(&self, sink: ScanSink) -> Result<()> {
        bump(&self.starts);
        let failure = self
            .fail_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(error) = failure {
            return Err(error);
        }
        for sighting in &self.script {
            sink.push(ScanEvent::Sighting(sighting.clone()));
        }
        *self.sink() = Some(sink);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        bump(&self.stops);
        self.sink().take();
        Ok(())
    }
}
