//! Delegate-style backend on top of `bluest`.
//!
//! The platform stack (CoreBluetooth, WinRT or BlueZ) reports results through
//! its own callbacks; bluest surfaces those as futures and streams. Devices
//! are identified by the platform id string, and since the platform never
//! exposes attribute handles, handles are synthesised per discovery pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, AdvertisingDevice, Characteristic, ConnectionEvent, Descriptor, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::transport::{
    Capabilities, ConnectAttempts, DisconnectReason, EventSender, RawCharacteristic, RawDescriptor, RawService,
    ScanSink, ScanTransport, Transport, TransportEvent,
};
use crate::core::bluetooth::types::{CharacteristicProperties, RawSighting, ScanEvent};
use crate::error::{BleError, Result};

/// Devices seen by the scanner, keyed by platform id. The transport opens
/// devices from here since platform ids cannot be built from a string.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, device: Device) {
        self.lock().insert(device.id().to_string(), device);
    }

    pub fn get(&self, address: &str) -> Option<Device> {
        self.lock().get(address).cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

pub(crate) fn translate(e: bluest::Error, fallback: fn(String) -> BleError) -> BleError {
    match e.kind() {
        ErrorKind::NotConnected => BleError::NotConnected,
        ErrorKind::NotFound => BleError::NotFound(e.to_string()),
        ErrorKind::NotSupported => BleError::NotSupported(e.to_string()),
        ErrorKind::Timeout => BleError::Timeout,
        _ => fallback(e.to_string()),
    }
}

fn properties(props: bluest::CharacteristicProperties) -> CharacteristicProperties {
    CharacteristicProperties {
        broadcast: props.broadcast,
        read: props.read,
        write_without_response: props.write_without_response,
        write: props.write,
        notify: props.notify,
        indicate: props.indicate,
        authenticated_signed_writes: props.authenticated_signed_writes,
        extended_properties: props.extended_properties,
    }
}

struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Link {
    device: Option<Device>,
    /// Device with a connect request in flight
    pending: Option<Device>,
    events: Option<EventSender>,
    /// Cancels the connection-event watcher
    watcher: Option<CancellationToken>,
    next_handle: u16,
    services: Vec<(u16, Service)>,
    characteristics: HashMap<u16, Characteristic>,
    descriptors: HashMap<u16, Descriptor>,
    subscriptions: HashMap<u16, Subscription>,
}

impl Link {
    fn assign_handle(&mut self) -> u16 {
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.next_handle
    }

    fn reset(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.cancel();
        }
        for (_, subscription) in self.subscriptions.drain() {
            subscription.cancel.cancel();
            subscription.task.abort();
        }
        *self = Link::default();
    }
}

pub struct DelegateTransport {
    adapter: Adapter,
    registry: DeviceRegistry,
    attempts: ConnectAttempts,
    link: Mutex<Link>,
}

impl DelegateTransport {
    pub fn new(adapter: Adapter, registry: DeviceRegistry) -> Self {
        Self {
            adapter,
            registry,
            attempts: ConnectAttempts::new(),
            link: Mutex::new(Link::default()),
        }
    }

    /// Opens the default adapter and waits until it is powered.
    pub async fn default_adapter(registry: DeviceRegistry) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BleError::Connection("Bluetooth adapter not found".to_string()))?;
        adapter
            .wait_available()
            .await
            .map_err(|e| translate(e, BleError::Connection))?;
        Ok(Self::new(adapter, registry))
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self) -> Result<Device> {
        self.link().device.clone().ok_or(BleError::NotConnected)
    }

    fn characteristic(&self, handle: u16) -> Result<Characteristic> {
        self.link()
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| BleError::NotFound(format!("characteristic 0x{:04x}", handle)))
    }

    fn descriptor(&self, handle: u16) -> Result<Descriptor> {
        self.link()
            .descriptors
            .get(&handle)
            .cloned()
            .ok_or_else(|| BleError::NotFound(format!("descriptor 0x{:04x}", handle)))
    }

    /// Looks the device up among scanned and already connected devices.
    async fn find_device(&self, address: &str) -> Result<Device> {
        if let Some(device) = self.registry.get(address) {
            return Ok(device);
        }
        let connected = self
            .adapter
            .connected_devices()
            .await
            .map_err(|e| translate(e, BleError::Connection))?;
        connected
            .into_iter()
            .find(|device| device.id().to_string() == address)
            .ok_or_else(|| BleError::NotFound(format!("device {} has not been discovered", address)))
    }

    fn watch_connection(&self, device: Device, events: EventSender) -> CancellationToken {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            let mut stream = match adapter.device_connection_events(&device).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Connection events unavailable for {}: {}", device.id(), e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            info!("Device {} disconnected", device.id());
                            events.push(TransportEvent::Disconnected(DisconnectReason::Peer));
                            break;
                        }
                        Some(ConnectionEvent::Connected) => {}
                        None => {
                            events.push(TransportEvent::Disconnected(DisconnectReason::TransportClosed));
                            break;
                        }
                    },
                }
            }
        });
        token
    }
}

#[async_trait]
impl Transport for DelegateTransport {
    fn name(&self) -> &'static str {
        "delegate"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            descriptors: true,
            notifications: true,
            write_without_response: true,
        }
    }

    async fn connect(&self, address: &str, events: EventSender) -> Result<()> {
        let device = self.find_device(address).await?;
        info!("Connecting to device: {} ({})", device.name().unwrap_or_else(|_| "Unknown".to_string()), address);
        let attempt = self.attempts.begin();
        self.link().pending = Some(device.clone());

        if !device.is_connected().await {
            let (adapter, target) = (self.adapter.clone(), device.clone());
            let connect = async move {
                adapter
                    .connect_device(&target)
                    .await
                    .map_err(|e| translate(e, BleError::Connection))
            };
            let (adapter, target) = (self.adapter.clone(), device.clone());
            let release = async move {
                if let Err(e) = adapter.disconnect_device(&target).await {
                    warn!("Releasing abandoned connection to {} failed: {}", target.id(), e);
                }
            };
            self.attempts.run(attempt, connect, release).await?;
        }

        let watcher = self.watch_connection(device.clone(), events.clone());
        let mut link = self.link();
        link.reset();
        link.device = Some(device);
        link.events = Some(events);
        link.watcher = Some(watcher);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.attempts.abandon();
        let (device, pending) = {
            let mut link = self.link();
            let device = link.device.take();
            let pending = link.pending.take();
            link.reset();
            (device, pending)
        };
        let Some(device) = device else {
            // Cancels a connect request the platform may still complete
            if let Some(pending) = pending {
                info!("Cancelling pending connect to {}", pending.id());
                return self
                    .adapter
                    .disconnect_device(&pending)
                    .await
                    .map_err(|e| translate(e, BleError::Connection));
            }
            return Ok(());
        };
        if !device.is_connected().await {
            info!("Device {} not connected", device.id());
            return Ok(());
        }
        info!("Disconnecting from device {}", device.id());
        self.adapter
            .disconnect_device(&device)
            .await
            .map_err(|e| translate(e, BleError::Connection))
    }

    async fn discover_services(&self) -> Result<Vec<RawService>> {
        let device = self.device()?;
        let services = device
            .discover_services()
            .await
            .map_err(|e| translate(e, BleError::Discovery))?;

        let mut link = self.link();
        link.services.clear();
        link.characteristics.clear();
        link.descriptors.clear();
        let mut raw = Vec::with_capacity(services.len());
        for service in services {
            let handle = link.assign_handle();
            debug!("Available service: {} (0x{:04x})", service.uuid(), handle);
            raw.push(RawService {
                uuid: service.uuid(),
                handle,
                range: None,
            });
            link.services.push((handle, service));
        }
        Ok(raw)
    }

    async fn discover_characteristics(&self) -> Result<Vec<RawCharacteristic>> {
        let services = self.link().services.clone();
        let mut raw = Vec::new();
        for (service_handle, service) in services {
            let characteristics = service
                .discover_characteristics()
                .await
                .map_err(|e| translate(e, BleError::Discovery))?;
            for characteristic in characteristics {
                let props = characteristic
                    .properties()
                    .await
                    .map_err(|e| translate(e, BleError::Discovery))?;
                let handle = {
                    let mut link = self.link();
                    let handle = link.assign_handle();
                    link.characteristics.insert(handle, characteristic.clone());
                    handle
                };
                raw.push(RawCharacteristic {
                    uuid: characteristic.uuid(),
                    handle,
                    properties: properties(props),
                    service_handle: Some(service_handle),
                });
            }
        }
        Ok(raw)
    }

    async fn discover_descriptors(&self) -> Result<Vec<RawDescriptor>> {
        let characteristics: Vec<(u16, Characteristic)> = {
            let link = self.link();
            let mut characteristics: Vec<_> = link
                .characteristics
                .iter()
                .map(|(handle, c)| (*handle, c.clone()))
                .collect();
            characteristics.sort_by_key(|(handle, _)| *handle);
            characteristics
        };
        let mut raw = Vec::new();
        for (characteristic_handle, characteristic) in characteristics {
            let descriptors = characteristic
                .discover_descriptors()
                .await
                .map_err(|e| translate(e, BleError::Discovery))?;
            for descriptor in descriptors {
                let handle = {
                    let mut link = self.link();
                    let handle = link.assign_handle();
                    link.descriptors.insert(handle, descriptor.clone());
                    handle
                };
                raw.push(RawDescriptor {
                    uuid: descriptor.uuid(),
                    handle,
                    characteristic_handle: Some(characteristic_handle),
                });
            }
        }
        Ok(raw)
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(handle)?;
        characteristic.read().await.map_err(|e| translate(e, BleError::Gatt))
    }

    async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        let written = if with_response {
            characteristic.write(data).await
        } else {
            characteristic.write_without_response(data).await
        };
        written.map_err(|e| translate(e, BleError::Gatt))
    }

    async fn subscribe(&self, handle: u16) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        let events = self.link().events.clone().ok_or(BleError::NotConnected)?;
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(translate(e, BleError::Gatt)));
                    return;
                }
            };
            debug!("Listening for notifications on 0x{:04x}", handle);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(value)) => {
                            events.push(TransportEvent::Notification { handle, value });
                        }
                        Some(Err(e)) => {
                            error!("Notification stream error on 0x{:04x}: {}", handle, e);
                            break;
                        }
                        None => {
                            info!("Notification stream ended on 0x{:04x}", handle);
                            break;
                        }
                    },
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                let previous = self.link().subscriptions.insert(handle, Subscription { cancel, task });
                if let Some(previous) = previous {
                    previous.cancel.cancel();
                    previous.task.abort();
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BleError::Gatt("notification task ended before subscribing".to_string())),
        }
    }

    async fn unsubscribe(&self, handle: u16) -> Result<()> {
        let subscription = self.link().subscriptions.remove(&handle);
        match subscription {
            Some(subscription) => {
                subscription.cancel.cancel();
                if let Err(e) = subscription.task.await {
                    if !e.is_cancelled() {
                        error!("Notification task for 0x{:04x} failed: {:?}", handle, e);
                    }
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let descriptor = self.descriptor(handle)?;
        descriptor.read().await.map_err(|e| translate(e, BleError::Gatt))
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let descriptor = self.descriptor(handle)?;
        descriptor.write(data).await.map_err(|e| translate(e, BleError::Gatt))
    }
}

/// Discovery half of the delegate backend.
pub struct DelegateScanner {
    adapter: Adapter,
    registry: DeviceRegistry,
    scan: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DelegateScanner {
    pub fn new(adapter: Adapter, registry: DeviceRegistry) -> Self {
        Self {
            adapter,
            registry,
            scan: Mutex::new(None),
        }
    }

    fn scan(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sighting(found: &AdvertisingDevice) -> RawSighting {
    let adv = &found.adv_data;
    let mut raw = RawSighting::for_address(found.device.id().to_string());
    raw.name = adv.local_name.clone().or_else(|| found.device.name().ok());
    raw.rssi = found.rssi;
    raw.manufacturer_data = adv
        .manufacturer_data
        .as_ref()
        .map(|m| HashMap::from([(m.company_id, m.data.clone())]));
    if !adv.service_data.is_empty() {
        raw.service_data = Some(adv.service_data.clone());
    }
    if !adv.services.is_empty() {
        raw.service_uuids = Some(adv.services.clone());
    }
    raw
}

#[async_trait]
impl ScanTransport for DelegateScanner {
    fn name(&self) -> &'static str {
        "delegate"
    }

    async fn start_scan(&self, sink: ScanSink) -> Result<()> {
        if self.scan().is_some() {
            return Err(BleError::Scan("scan already running".to_string()));
        }
        self.registry.clear();

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            if let Ok(connected) = adapter.connected_devices().await {
                for device in connected {
                    registry.insert(device.clone());
                    let mut raw = RawSighting::for_address(device.id().to_string());
                    raw.name = device.name().ok();
                    sink.push(ScanEvent::Sighting(raw));
                }
            }

            let mut stream = match adapter.scan(&[]).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(translate(e, BleError::Scan)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        info!("Scan task received cancellation signal. Exiting.");
                        break;
                    }
                    found = stream.next() => match found {
                        Some(found) => {
                            registry.insert(found.device.clone());
                            sink.push(ScanEvent::Sighting(sighting(&found)));
                        }
                        None => {
                            warn!("Scan stream has ended.");
                            break;
                        }
                    },
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.scan() = Some((cancel, task));
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BleError::Scan("scan task ended before starting".to_string())),
        }
    }

    async fn stop_scan(&self) -> Result<()> {
        let Some((cancel, task)) = self.scan().take() else {
            return Ok(());
        };
        cancel.cancel();
        match task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(BleError::Scan(format!("scan task failed: {:?}", e))),
        }
    }
}

impl Drop for DelegateScanner {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.scan().take() {
            cancel.cancel();
        }
    }
}
