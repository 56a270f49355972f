//! Connection half of the native-library backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionId, GattLibrary, NativeResult, NativeStatus, OPTIONS_DEFAULT};
use crate::core::bluetooth::constants::DEFAULT_ADAPTER;
use crate::core::bluetooth::transport::{
    Capabilities, DisconnectReason, EventSender, HandleRange, RawCharacteristic, RawService,
    Transport, TransportEvent,
};
use crate::core::bluetooth::types::CharacteristicProperties;
use crate::error::{BleError, Result};

#[derive(Default)]
struct Link {
    connection: Option<ConnectionId>,
    /// Bumped by every connect and disconnect; a blocking connect that
    /// returns under a stale attempt is torn down immediately.
    attempt: u64,
    /// The library addresses characteristics by UUID only
    uuids: HashMap<u16, Uuid>,
}

pub struct NativeTransport {
    library: Arc<dyn GattLibrary>,
    adapter: String,
    options: u32,
    link: Arc<Mutex<Link>>,
}

impl NativeTransport {
    pub fn new(library: Arc<dyn GattLibrary>) -> Self {
        Self {
            library,
            adapter: DEFAULT_ADAPTER.to_string(),
            options: OPTIONS_DEFAULT,
            link: Arc::new(Mutex::new(Link::default())),
        }
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = adapter.into();
        self
    }

    /// Connection options bit field, see `OPTIONS_*`.
    pub fn with_options(mut self, options: u32) -> Self {
        self.options = options;
        self
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    fn connection(&self) -> Result<ConnectionId> {
        self.link().connection.ok_or(BleError::NotConnected)
    }

    /// Runs one library call on the blocking pool.
    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&dyn GattLibrary) -> T + Send + 'static,
        T: Send + 'static,
    {
        let library = self.library.clone();
        tokio::task::spawn_blocking(move || call(library.as_ref()))
            .await
            .map_err(|e| BleError::Io(format!("native library call aborted: {}", e)))
    }

    fn uuid_for(&self, handle: u16) -> Result<Uuid> {
        let link = self.link();
        let uuid = link
            .uuids
            .get(&handle)
            .copied()
            .ok_or_else(|| BleError::NotFound(format!("characteristic 0x{:04x}", handle)))?;
        let shadowed = link.uuids.iter().any(|(other, u)| *u == uuid && *other < handle);
        if shadowed {
            warn!(
                "Characteristic 0x{:04x} shares UUID {} with a lower handle; the library will address the first one",
                handle, uuid
            );
        }
        Ok(uuid)
    }
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for NativeTransport {
    fn name(&self) -> &'static str {
        "native"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            descriptors: false,
            notifications: false,
            write_without_response: true,
        }
    }

    async fn connect(&self, address: &str, events: EventSender) -> Result<()> {
        let attempt = {
            let mut link = self.link();
            if link.connection.is_some() {
                return Err(BleError::Connection("already connected".to_string()));
            }
            link.attempt += 1;
            link.attempt
        };
        debug!("Connecting to device @ {} with {}", address, self.adapter);

        let shared = self.link.clone();
        let adapter = self.adapter.clone();
        let target = address.to_string();
        let options = self.options;
        // The whole exchange stays on the blocking thread so that a caller
        // giving up on the await cannot leak a late connection.
        let connected = self
            .blocking(move |library| -> NativeResult<ConnectionId> {
                let connection = library.connect(&adapter, &target, options)?;
                let stale = {
                    let mut link = lock(&shared);
                    if link.attempt == attempt {
                        link.connection = Some(connection);
                        false
                    } else {
                        true
                    }
                };
                if stale {
                    warn!("Connect to {} finished after it was abandoned, releasing it", target);
                    if let Err(status) = library.disconnect(connection) {
                        warn!("Releasing abandoned connection failed: {}", status);
                    }
                    return Err(NativeStatus::INTERNAL_ERROR);
                }
                let hook = library.register_on_disconnect(
                    connection,
                    Arc::new(move || {
                        debug!("Native library reported a dropped link");
                        events.push(TransportEvent::Disconnected(DisconnectReason::Peer));
                    }),
                );
                if let Err(status) = hook {
                    debug!("No disconnect hook on this library: {}", status);
                }
                Ok(connection)
            })
            .await?;

        match connected {
            Ok(connection) => {
                info!("Connected to {} ({:?})", address, connection);
                Ok(())
            }
            Err(status) => Err(status.into_error(BleError::Connection)),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let connection = {
            let mut link = self.link();
            link.attempt += 1;
            link.uuids.clear();
            link.connection.take()
        };
        let Some(connection) = connection else {
            return Ok(());
        };
        debug!("Disconnecting {:?}", connection);
        self.blocking(move |library| library.disconnect(connection))
            .await?
            .map_err(|status| status.into_error(BleError::Connection))
    }

    async fn discover_services(&self) -> Result<Vec<RawService>> {
        let connection = self.connection()?;
        let services = self
            .blocking(move |library| library.discover_primary(connection))
            .await?
            .map_err(|status| status.into_error(BleError::Discovery))?;
        Ok(services
            .into_iter()
            .map(|service| {
                debug!(
                    "Service UUID: {} ({},{})",
                    service.uuid, service.attr_handle_start, service.attr_handle_end
                );
                RawService {
                    uuid: service.uuid,
                    handle: service.attr_handle_start,
                    range: Some(HandleRange::new(service.attr_handle_start, service.attr_handle_end)),
                }
            })
            .collect())
    }

    async fn discover_characteristics(&self) -> Result<Vec<RawCharacteristic>> {
        let connection = self.connection()?;
        let characteristics = self
            .blocking(move |library| library.discover_characteristics(connection))
            .await?
            .map_err(|status| status.into_error(BleError::Discovery))?;

        let mut link = self.link();
        link.uuids = characteristics.iter().map(|c| (c.handle, c.uuid)).collect();
        Ok(characteristics
            .into_iter()
            .map(|c| RawCharacteristic {
                uuid: c.uuid,
                handle: c.handle,
                properties: CharacteristicProperties::from_bits(c.properties),
                service_handle: None,
            })
            .collect())
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        let connection = self.connection()?;
        let uuid = self.uuid_for(handle)?;
        self.blocking(move |library| library.read_char_by_uuid(connection, uuid))
            .await?
            .map_err(|status| status.into_error(BleError::Gatt))
    }

    async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        let connection = self.connection()?;
        let uuid = self.uuid_for(handle)?;
        let data = data.to_vec();
        self.blocking(move |library| {
            if with_response {
                library.write_char_by_uuid(connection, uuid, &data)
            } else {
                library.write_without_response_char_by_uuid(connection, uuid, &data)
            }
        })
        .await?
        .map_err(|status| status.into_error(BleError::Gatt))
    }
}
