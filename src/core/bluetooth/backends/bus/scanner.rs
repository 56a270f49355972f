//! Discovery half of the bus backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};
use uuid::Uuid;

use super::{
    BusBody, BusConnection, BusMessage, BusReply, BusRequest, BusValue, PropertyMap,
    SignalHandler, prop_str, translate,
};
use crate::core::bluetooth::constants::{
    ADAPTER_INTERFACE, DEFAULT_ADAPTER, DEVICE_INTERFACE, OBJECT_MANAGER_INTERFACE,
};
use crate::core::bluetooth::transport::{ScanSink, ScanTransport};
use crate::core::bluetooth::types::{RawSighting, ScanEvent};
use crate::error::{BleError, Result};
use crate::utils::{extract_mac_address, is_mac_address};

#[derive(Default)]
struct ScanState {
    subscription: Option<u64>,
    /// Device properties the stack already knew before this scan
    cached: HashMap<String, PropertyMap>,
    /// object path -> address, for removals
    addresses: HashMap<String, String>,
}

pub struct BusScanner {
    bus: Arc<dyn BusConnection>,
    adapter: String,
    filters: PropertyMap,
    state: Arc<Mutex<ScanState>>,
}

impl BusScanner {
    pub fn new(bus: Arc<dyn BusConnection>) -> Self {
        Self {
            bus,
            adapter: DEFAULT_ADAPTER.to_string(),
            filters: PropertyMap::new(),
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = adapter.into();
        self
    }

    /// Discovery filter passed to the adapter. `Transport` defaults to `le`.
    pub fn with_filters(mut self, filters: PropertyMap) -> Self {
        self.filters = filters;
        self
    }

    fn adapter_path(&self) -> String {
        format!("/org/bluez/{}", self.adapter)
    }

    fn effective_filters(&self) -> PropertyMap {
        let mut filters = self.filters.clone();
        filters
            .entry("Transport".to_string())
            .or_insert_with(|| BusValue::Str("le".to_string()));
        filters
    }

    fn state(&self) -> MutexGuard<'_, ScanState> {
        lock(&self.state)
    }

    async fn call(&self, request: BusRequest) -> Result<BusReply> {
        self.bus.call(request).await.map_err(|e| translate(e, BleError::Scan))
    }

    fn release(&self) {
        let subscription = {
            let mut state = self.state();
            let subscription = state.subscription.take();
            *state = ScanState::default();
            subscription
        };
        if let Some(subscription) = subscription {
            self.bus.unsubscribe(subscription);
        }
    }
}

fn lock(state: &Mutex<ScanState>) -> MutexGuard<'_, ScanState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts device properties into a partial sighting. Only the properties
/// present in `props` are set.
pub(crate) fn sighting_from_props(path: &str, props: &PropertyMap) -> RawSighting {
    let address = match prop_str(props, "Address") {
        Some(address) => Some(address.to_string()),
        None => path
            .rsplit('/')
            .next()
            .and_then(|leaf| leaf.strip_prefix("dev_"))
            .and_then(extract_mac_address)
            .filter(|address| is_mac_address(address)),
    };
    let name = prop_str(props, "Name")
        .or_else(|| prop_str(props, "Alias"))
        .map(str::to_string);
    let rssi = match props.get("RSSI") {
        Some(BusValue::Int16(rssi)) => Some(*rssi),
        _ => None,
    };
    let manufacturer_data = match props.get("ManufacturerData") {
        Some(BusValue::ManufacturerData(data)) => Some(data.clone()),
        _ => None,
    };
    let service_data = match props.get("ServiceData") {
        Some(BusValue::ServiceData(data)) => Some(
            data.iter()
                .filter_map(|(uuid, value)| Some((Uuid::parse_str(uuid).ok()?, value.clone())))
                .collect(),
        ),
        _ => None,
    };
    let service_uuids = match props.get("UUIDs") {
        Some(BusValue::StrList(uuids)) => Some(
            uuids
                .iter()
                .filter_map(|uuid| Uuid::parse_str(uuid).ok())
                .collect(),
        ),
        _ => None,
    };
    RawSighting {
        address,
        name,
        rssi,
        manufacturer_data,
        service_data,
        service_uuids,
    }
}

fn on_signal(state: &Mutex<ScanState>, sink: &ScanSink, adapter_path: &str, message: &BusMessage) {
    let prefix = format!("{}/", adapter_path);
    let event = {
        let mut state = lock(state);
        match &message.body {
            BusBody::InterfacesAdded { object, interfaces } if object.starts_with(&prefix) => {
                let Some(props) = interfaces.get(DEVICE_INTERFACE) else {
                    return;
                };
                sighting(&mut state, object, props)
            }
            BusBody::PropertiesChanged { interface, changed, .. }
                if interface == DEVICE_INTERFACE && message.path.starts_with(&prefix) =>
            {
                sighting(&mut state, &message.path, changed)
            }
            BusBody::InterfacesRemoved { object, interfaces }
                if interfaces.iter().any(|i| i == DEVICE_INTERFACE) =>
            {
                state.cached.remove(object);
                state.addresses.remove(object).map(ScanEvent::Removed)
            }
            _ => None,
        }
    };
    if let Some(event) = event {
        sink.push(event);
    }
}

/// Whatever the stack had cached for a path is folded into the next sighting
/// of it, including paths that signalled before the cache was loaded.
fn sighting(state: &mut ScanState, path: &str, changed: &PropertyMap) -> Option<ScanEvent> {
    let props = match state.cached.remove(path) {
        Some(mut props) => {
            props.extend(changed.clone());
            props
        }
        None => changed.clone(),
    };
    let mut raw = sighting_from_props(path, &props);
    match &raw.address {
        Some(address) => {
            state.addresses.insert(path.to_string(), address.clone());
        }
        None => {
            raw.address = state.addresses.get(path).cloned();
        }
    }
    debug!("{:?} ({:?} dBm), Object Path: {}", raw.address, raw.rssi, path);
    Some(ScanEvent::Sighting(raw))
}

#[async_trait]
impl ScanTransport for BusScanner {
    fn name(&self) -> &'static str {
        "bus"
    }

    async fn start_scan(&self, sink: ScanSink) -> Result<()> {
        let adapter_path = self.adapter_path();
        let handler: SignalHandler = {
            let state = self.state.clone();
            let adapter_path = adapter_path.clone();
            Arc::new(move |message: &BusMessage| on_signal(&state, &sink, &adapter_path, message))
        };
        let subscription = self.bus.subscribe(handler);
        self.state().subscription = Some(subscription);

        let started = async {
            let reply = self
                .call(BusRequest::new("/", OBJECT_MANAGER_INTERFACE, "GetManagedObjects"))
                .await?;
            if let BusReply::ManagedObjects(objects) = reply {
                let cached = objects
                    .into_iter()
                    .filter_map(|(path, mut interfaces)| {
                        interfaces.remove(DEVICE_INTERFACE).map(|props| (path, props))
                    })
                    .collect();
                self.state().cached = cached;
            }
            self.call(
                BusRequest::new(adapter_path.as_str(), ADAPTER_INTERFACE, "SetDiscoveryFilter")
                    .arg(BusValue::Dict(self.effective_filters())),
            )
            .await?;
            self.call(BusRequest::new(adapter_path.as_str(), ADAPTER_INTERFACE, "StartDiscovery"))
                .await
        }
        .await;

        if let Err(e) = started {
            warn!("Starting discovery on {} failed: {}", adapter_path, e);
            self.release();
            return Err(e);
        }
        info!("Discovery started on {}", adapter_path);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let adapter_path = self.adapter_path();
        let result = self
            .call(BusRequest::new(adapter_path.as_str(), ADAPTER_INTERFACE, "StopDiscovery"))
            .await
            .map(|_| ());
        self.release();
        result
    }
}
