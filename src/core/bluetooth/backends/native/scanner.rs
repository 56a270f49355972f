use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{AdapterId, DiscoveredCallback, GattLibrary, NativeResult};
use crate::core::bluetooth::constants::DEFAULT_ADAPTER;
use crate::core::bluetooth::transport::{ScanSink, ScanTransport};
use crate::core::bluetooth::types::{RawSighting, ScanEvent, parse_manufacturer_data};
use crate::error::{BleError, Result};

/// An open adapter with scanning enabled. Scanning is disabled and the
/// adapter closed when the registration is released or dropped.
struct ScanRegistration {
    library: Arc<dyn GattLibrary>,
    adapter: AdapterId,
    active: bool,
}

impl ScanRegistration {
    fn release(&mut self) -> NativeResult<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let disabled = self.library.scan_disable(self.adapter);
        if let Err(status) = self.library.adapter_close(self.adapter) {
            warn!("Closing adapter {:?} failed: {}", self.adapter, status);
        }
        disabled
    }
}

impl Drop for ScanRegistration {
    fn drop(&mut self) {
        if let Err(status) = self.release() {
            warn!("Disabling scan on drop failed: {}", status);
        }
    }
}

pub struct NativeScanner {
    library: Arc<dyn GattLibrary>,
    adapter: String,
    registration: Mutex<Option<ScanRegistration>>,
}

impl NativeScanner {
    pub fn new(library: Arc<dyn GattLibrary>) -> Self {
        Self {
            library,
            adapter: DEFAULT_ADAPTER.to_string(),
            registration: Mutex::new(None),
        }
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = adapter.into();
        self
    }

    fn registration(&self) -> MutexGuard<'_, Option<ScanRegistration>> {
        self.registration.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds a sighting for a device reported by the library thread, enriched
/// with whatever advertisement data the library has cached for it.
fn sighting(library: &dyn GattLibrary, adapter: AdapterId, address: &str, name: Option<&str>) -> RawSighting {
    let mut raw = RawSighting::for_address(address);
    raw.name = name.map(str::to_string);
    match library.advertisement_data(adapter, address) {
        Ok(advertisement) => {
            raw.manufacturer_data = Some(
                parse_manufacturer_data(&advertisement.manufacturer_data)
                    .into_iter()
                    .collect::<HashMap<_, _>>(),
            );
            raw.service_data = Some(advertisement.service_data.into_iter().collect());
            raw.service_uuids = Some(advertisement.service_uuids);
        }
        Err(status) => debug!("No advertisement data for {}: {}", address, status),
    }
    raw
}

#[async_trait]
impl ScanTransport for NativeScanner {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn start_scan(&self, sink: ScanSink) -> Result<()> {
        if self.registration().is_some() {
            return Err(BleError::Scan("scan already running".to_string()));
        }

        let library = self.library.clone();
        let adapter_name = self.adapter.clone();
        let registration = tokio::task::spawn_blocking(move || -> Result<ScanRegistration> {
            let adapter = library
                .adapter_open(&adapter_name)
                .map_err(|status| BleError::Scan(format!("Failed to open adapter ({}): {}", adapter_name, status)))?;
            let registration = ScanRegistration {
                library: library.clone(),
                adapter,
                active: true,
            };

            let weak: Weak<dyn GattLibrary> = Arc::downgrade(&library);
            let callback: DiscoveredCallback = Arc::new(move |address: &str, name: Option<&str>| {
                let Some(library) = weak.upgrade() else { return };
                sink.push(ScanEvent::Sighting(sighting(library.as_ref(), adapter, address, name)));
            });
            if let Err(status) = library.scan_enable(adapter, callback) {
                // dropping the registration disables and closes the adapter
                drop(registration);
                return Err(status.into_error(BleError::Scan));
            }
            Ok(registration)
        })
        .await
        .map_err(|e| BleError::Scan(format!("native library call aborted: {}", e)))??;

        *self.registration() = Some(registration);
        info!("Native scan started on {}", self.adapter);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let Some(mut registration) = self.registration().take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || registration.release())
            .await
            .map_err(|e| BleError::Scan(format!("native library call aborted: {}", e)))?
            .map_err(|status| status.into_error(BleError::Scan))
    }
}
