//! Connection-oriented half of the bus backend.
//!
//! The transport keeps an up-to-date copy of every object below the device
//! path: it is seeded from `GetManagedObjects` at connect time and then
//! maintained from `InterfacesAdded`, `InterfacesRemoved` and
//! `PropertiesChanged` signals. Discovery reads that cache once the device
//! reports `ServicesResolved`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::watch;

use super::{
    BusBody, BusConnection, BusMessage, BusReply, BusRequest, BusValue, ManagedObjects,
    PropertyMap, SignalHandler, handle_from_path, prop_bool, prop_str, prop_uuid, translate,
};
use crate::core::bluetooth::constants::{
    DEFAULT_ADAPTER, DEVICE_INTERFACE, DISCOVERY_TIMEOUT_SECS, GATT_CHARACTERISTIC_INTERFACE,
    GATT_DESCRIPTOR_INTERFACE, GATT_SERVICE_INTERFACE, OBJECT_MANAGER_INTERFACE,
};
use crate::core::bluetooth::transport::{
    Capabilities, DisconnectReason, EventSender, RawCharacteristic, RawDescriptor, RawService,
    Transport, TransportEvent,
};
use crate::core::bluetooth::types::CharacteristicProperties;
use crate::error::{BleError, Result};
use crate::utils::is_mac_address;

#[derive(Default)]
struct LinkCache {
    device_path: Option<String>,
    /// Objects strictly below the device path
    objects: ManagedObjects,
    device_props: PropertyMap,
    events: Option<EventSender>,
    subscription: Option<u64>,
    /// Characteristic paths with an active StartNotify
    notifying: HashSet<String>,
}

pub struct BusTransport {
    bus: Arc<dyn BusConnection>,
    adapter: String,
    cache: Arc<Mutex<LinkCache>>,
    services_resolved: watch::Sender<bool>,
    resolve_timeout: Duration,
    write_without_response: bool,
}

impl BusTransport {
    pub fn new(bus: Arc<dyn BusConnection>) -> Self {
        let (services_resolved, _) = watch::channel(false);
        Self {
            bus,
            adapter: DEFAULT_ADAPTER.to_string(),
            cache: Arc::new(Mutex::new(LinkCache::default())),
            services_resolved,
            resolve_timeout: Duration::from_secs(DISCOVERY_TIMEOUT_SECS),
            write_without_response: true,
        }
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = adapter.into();
        self
    }

    /// How long discovery waits for the stack to finish resolving services.
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Stacks too old to accept a write type only do writes with response.
    pub fn with_write_without_response(mut self, supported: bool) -> Self {
        self.write_without_response = supported;
        self
    }

    pub fn device_path(&self, address: &str) -> Result<String> {
        if !is_mac_address(address) {
            return Err(BleError::Connection(format!("{} is not a device address", address)));
        }
        Ok(format!(
            "/org/bluez/{}/dev_{}",
            self.adapter,
            address.to_ascii_uppercase().replace(':', "_")
        ))
    }

    fn cache(&self) -> MutexGuard<'_, LinkCache> {
        lock(&self.cache)
    }

    fn current_device(&self) -> Result<String> {
        self.cache().device_path.clone().ok_or(BleError::NotConnected)
    }

    async fn call(&self, request: BusRequest, fallback: fn(String) -> BleError) -> Result<BusReply> {
        let member = request.member.clone();
        let path = request.path.clone();
        self.bus.call(request).await.map_err(|e| {
            debug!("{} on {} failed: {}", member, path, e);
            translate(e, fallback)
        })
    }

    /// Object path of the attribute with `handle` carrying `interface`.
    fn attribute_path(&self, interface: &str, handle: u16) -> Result<String> {
        self.cache()
            .objects
            .iter()
            .find(|(path, interfaces)| {
                interfaces.contains_key(interface) && handle_from_path(path) == Some(handle)
            })
            .map(|(path, _)| path.clone())
            .ok_or_else(|| BleError::NotFound(format!("attribute 0x{:04x} on the bus", handle)))
    }

    async fn wait_services_resolved(&self) -> Result<()> {
        let mut resolved = self.services_resolved.subscribe();
        if *resolved.borrow() {
            return Ok(());
        }
        debug!("Waiting for ServicesResolved");
        match tokio::time::timeout(self.resolve_timeout, resolved.wait_for(|r| *r)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BleError::NotConnected),
            Err(_) => Err(BleError::Timeout),
        }
    }

    fn objects_with(&self, interface: &str) -> Vec<(String, PropertyMap)> {
        self.cache()
            .objects
            .iter()
            .filter_map(|(path, interfaces)| {
                interfaces
                    .get(interface)
                    .map(|props| (path.clone(), props.clone()))
            })
            .collect()
    }

    fn release_cache(&self) -> Option<u64> {
        let mut cache = self.cache();
        let subscription = cache.subscription.take();
        *cache = LinkCache::default();
        self.services_resolved.send_replace(false);
        subscription
    }
}

fn lock(cache: &Mutex<LinkCache>) -> MutexGuard<'_, LinkCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies one signal to the cache. Runs on the bus thread; events are
/// pushed after the lock is released.
fn on_signal(
    cache: &Mutex<LinkCache>,
    services_resolved: &watch::Sender<bool>,
    device_path: &str,
    message: &BusMessage,
) {
    let mut pending = Vec::new();
    let events = {
        let mut cache = lock(cache);
        if cache.device_path.as_deref() != Some(device_path) {
            return;
        }
        let child_prefix = format!("{}/", device_path);

        match &message.body {
            BusBody::InterfacesAdded { object, interfaces } if object.starts_with(&child_prefix) => {
                debug!("InterfacesAdded: {} {:?}", object, interfaces.keys());
                let entry = cache.objects.entry(object.clone()).or_default();
                for (interface, props) in interfaces {
                    entry.insert(interface.clone(), props.clone());
                }
            }
            BusBody::InterfacesRemoved { object, interfaces } if object.starts_with(&child_prefix) => {
                debug!("InterfacesRemoved: {} {:?}", object, interfaces);
                if let Some(entry) = cache.objects.get_mut(object) {
                    for interface in interfaces {
                        entry.remove(interface);
                    }
                    if entry.is_empty() {
                        cache.objects.remove(object);
                    }
                }
            }
            BusBody::PropertiesChanged { interface, changed, .. } => {
                if interface == GATT_CHARACTERISTIC_INTERFACE && message.path.starts_with(&child_prefix) {
                    if let Some(props) = cache
                        .objects
                        .get_mut(&message.path)
                        .and_then(|i| i.get_mut(GATT_CHARACTERISTIC_INTERFACE))
                    {
                        props.extend(changed.clone());
                    }
                    if let (true, Some(BusValue::Bytes(value))) =
                        (cache.notifying.contains(&message.path), changed.get("Value"))
                    {
                        if let Some(handle) = handle_from_path(&message.path) {
                            pending.push(TransportEvent::Notification {
                                handle,
                                value: value.clone(),
                            });
                        }
                    }
                } else if interface == DEVICE_INTERFACE && message.path == device_path {
                    cache.device_props.extend(changed.clone());
                    match prop_bool(changed, "ServicesResolved") {
                        Some(true) => {
                            services_resolved.send_replace(true);
                        }
                        Some(false) => {
                            services_resolved.send_replace(false);
                            pending.push(TransportEvent::ServicesChanged);
                        }
                        None => {}
                    }
                    if prop_bool(changed, "Connected") == Some(false) {
                        info!("Device {} disconnected.", device_path);
                        pending.push(TransportEvent::Disconnected(DisconnectReason::Peer));
                    }
                }
            }
            _ => {}
        }
        cache.events.clone()
    };

    if let Some(events) = events {
        for event in pending {
            events.push(event);
        }
    }
}

#[async_trait]
impl Transport for BusTransport {
    fn name(&self) -> &'static str {
        "bus"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            descriptors: true,
            notifications: true,
            write_without_response: self.write_without_response,
        }
    }

    async fn connect(&self, address: &str, events: EventSender) -> Result<()> {
        let device_path = self.device_path(address)?;
        debug!("Connecting to BLE device @ {} with {}", address, self.adapter);

        {
            let mut cache = self.cache();
            *cache = LinkCache {
                device_path: Some(device_path.clone()),
                events: Some(events),
                ..Default::default()
            };
        }
        self.services_resolved.send_replace(false);

        let handler: SignalHandler = {
            let cache = self.cache.clone();
            let services_resolved = self.services_resolved.clone();
            let device_path = device_path.clone();
            Arc::new(move |message: &BusMessage| {
                on_signal(&cache, &services_resolved, &device_path, message)
            })
        };
        let subscription = self.bus.subscribe(handler);
        self.cache().subscription = Some(subscription);

        let reply = self
            .call(
                BusRequest::new("/", OBJECT_MANAGER_INTERFACE, "GetManagedObjects"),
                BleError::Connection,
            )
            .await?;
        let BusReply::ManagedObjects(objects) = reply else {
            return Err(BleError::Connection("unexpected GetManagedObjects reply".to_string()));
        };
        let Some(device) = objects.get(&device_path).and_then(|i| i.get(DEVICE_INTERFACE)) else {
            return Err(BleError::Connection(format!(
                "Device with address {} could not be found",
                address
            )));
        };

        let child_prefix = format!("{}/", device_path);
        let resolved = prop_bool(device, "ServicesResolved").unwrap_or(false);
        {
            let mut cache = self.cache();
            cache.device_props = device.clone();
            for (path, interfaces) in objects.iter().filter(|(p, _)| p.starts_with(&child_prefix)) {
                cache
                    .objects
                    .entry(path.clone())
                    .or_insert_with(|| interfaces.clone());
            }
        }
        if resolved {
            self.services_resolved.send_replace(true);
        }

        self.call(
            BusRequest::new(device_path.as_str(), DEVICE_INTERFACE, "Connect"),
            BleError::Connection,
        )
        .await?;
        self.cache()
            .device_props
            .insert("Connected".to_string(), BusValue::Bool(true));
        debug!("Connection successful.");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let (device_path, notifying) = {
            let cache = self.cache();
            (cache.device_path.clone(), cache.notifying.clone())
        };
        let Some(device_path) = device_path else {
            return Ok(());
        };

        for path in notifying {
            let stop = BusRequest::new(path.as_str(), GATT_CHARACTERISTIC_INTERFACE, "StopNotify");
            if let Err(e) = self.call(stop, BleError::Gatt).await {
                error!("Could not remove notifications on {}: {}", path, e);
            }
        }

        let result = self
            .call(
                BusRequest::new(device_path.as_str(), DEVICE_INTERFACE, "Disconnect"),
                BleError::Connection,
            )
            .await
            .map(|_| ());
        if let Err(e) = &result {
            error!("Attempt to disconnect device failed: {}", e);
        }

        if let Some(subscription) = self.release_cache() {
            self.bus.unsubscribe(subscription);
        }
        match result {
            // Already gone is what we wanted.
            Err(BleError::NotConnected) => Ok(()),
            other => other,
        }
    }

    async fn discover_services(&self) -> Result<Vec<RawService>> {
        self.current_device()?;
        self.wait_services_resolved().await?;
        let services = self
            .objects_with(GATT_SERVICE_INTERFACE)
            .into_iter()
            .filter_map(|(path, props)| {
                let uuid = prop_uuid(&props, "UUID");
                let handle = handle_from_path(&path);
                match (uuid, handle) {
                    (Some(uuid), Some(handle)) => Some(RawService { uuid, handle, range: None }),
                    _ => {
                        warn!("Skipping malformed service object {}", path);
                        None
                    }
                }
            })
            .collect();
        Ok(services)
    }

    async fn discover_characteristics(&self) -> Result<Vec<RawCharacteristic>> {
        self.current_device()?;
        let characteristics = self
            .objects_with(GATT_CHARACTERISTIC_INTERFACE)
            .into_iter()
            .filter_map(|(path, props)| {
                let uuid = prop_uuid(&props, "UUID")?;
                let handle = handle_from_path(&path)?;
                let properties = match props.get("Flags") {
                    Some(BusValue::StrList(flags)) => CharacteristicProperties::from_flags(flags),
                    _ => CharacteristicProperties::default(),
                };
                Some(RawCharacteristic {
                    uuid,
                    handle,
                    properties,
                    service_handle: prop_str(&props, "Service").and_then(handle_from_path),
                })
            })
            .collect();
        Ok(characteristics)
    }

    async fn discover_descriptors(&self) -> Result<Vec<RawDescriptor>> {
        self.current_device()?;
        let descriptors = self
            .objects_with(GATT_DESCRIPTOR_INTERFACE)
            .into_iter()
            .filter_map(|(path, props)| {
                Some(RawDescriptor {
                    uuid: prop_uuid(&props, "UUID")?,
                    handle: handle_from_path(&path)?,
                    characteristic_handle: prop_str(&props, "Characteristic").and_then(handle_from_path),
                })
            })
            .collect();
        Ok(descriptors)
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        let path = self.attribute_path(GATT_CHARACTERISTIC_INTERFACE, handle)?;
        let request = BusRequest::new(path.as_str(), GATT_CHARACTERISTIC_INTERFACE, "ReadValue")
            .arg(BusValue::Dict(PropertyMap::new()));
        match self.call(request, BleError::Gatt).await? {
            BusReply::Bytes(value) => {
                debug!("Read Characteristic {}: {:?}", path, value);
                Ok(value)
            }
            other => Err(BleError::Gatt(format!("unexpected ReadValue reply {:?}", other))),
        }
    }

    async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        let path = self.attribute_path(GATT_CHARACTERISTIC_INTERFACE, handle)?;
        let kind = if with_response { "request" } else { "command" };
        let options = PropertyMap::from([("type".to_string(), BusValue::Str(kind.to_string()))]);
        let request = BusRequest::new(path.as_str(), GATT_CHARACTERISTIC_INTERFACE, "WriteValue")
            .arg(BusValue::Bytes(data.to_vec()))
            .arg(BusValue::Dict(options));
        self.call(request, BleError::Gatt).await?;
        debug!("Write Characteristic {}: {:?}", path, data);
        Ok(())
    }

    async fn subscribe(&self, handle: u16) -> Result<()> {
        let path = self.attribute_path(GATT_CHARACTERISTIC_INTERFACE, handle)?;
        // Marked first so a value arriving with the reply is not dropped.
        self.cache().notifying.insert(path.clone());
        let request = BusRequest::new(path.as_str(), GATT_CHARACTERISTIC_INTERFACE, "StartNotify");
        if let Err(e) = self.call(request, BleError::Gatt).await {
            self.cache().notifying.remove(&path);
            return Err(e);
        }
        Ok(())
    }

    async fn unsubscribe(&self, handle: u16) -> Result<()> {
        let path = self.attribute_path(GATT_CHARACTERISTIC_INTERFACE, handle)?;
        let request = BusRequest::new(path.as_str(), GATT_CHARACTERISTIC_INTERFACE, "StopNotify");
        let result = self.call(request, BleError::Gatt).await.map(|_| ());
        self.cache().notifying.remove(&path);
        result
    }

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let path = self.attribute_path(GATT_DESCRIPTOR_INTERFACE, handle)?;
        let request = BusRequest::new(path.as_str(), GATT_DESCRIPTOR_INTERFACE, "ReadValue")
            .arg(BusValue::Dict(PropertyMap::new()));
        match self.call(request, BleError::Gatt).await? {
            BusReply::Bytes(value) => Ok(value),
            other => Err(BleError::Gatt(format!("unexpected ReadValue reply {:?}", other))),
        }
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let path = self.attribute_path(GATT_DESCRIPTOR_INTERFACE, handle)?;
        let options = PropertyMap::from([("type".to_string(), BusValue::Str("command".to_string()))]);
        let request = BusRequest::new(path.as_str(), GATT_DESCRIPTOR_INTERFACE, "WriteValue")
            .arg(BusValue::Bytes(data.to_vec()))
            .arg(BusValue::Dict(options));
        self.call(request, BleError::Gatt).await.map(|_| ())
    }
}
