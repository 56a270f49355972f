//! Native-library backend.
//!
//! Wraps a synchronous GATT library that reports failures as integer status
//! codes and pushes scan results through a callback on a thread it owns.
//! The FFI declarations live with the embedding application, which hands us
//! an implementation of [`GattLibrary`].

mod client;
mod scanner;

use std::sync::Arc;

use uuid::Uuid;

use crate::error::BleError;

pub use client::NativeTransport;
pub use scanner::NativeScanner;

/// Status code returned by every library call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeStatus(pub i32);

impl NativeStatus {
    pub const SUCCESS: NativeStatus = NativeStatus(0);
    pub const INVALID_PARAMETER: NativeStatus = NativeStatus(1);
    pub const NOT_FOUND: NativeStatus = NativeStatus(2);
    pub const OUT_OF_MEMORY: NativeStatus = NativeStatus(3);
    pub const NOT_SUPPORTED: NativeStatus = NativeStatus(4);
    pub const DEVICE_ERROR: NativeStatus = NativeStatus(5);
    pub const DBUS_ERROR: NativeStatus = NativeStatus(6);
    pub const BLUEZ_ERROR: NativeStatus = NativeStatus(7);
    pub const INTERNAL_ERROR: NativeStatus = NativeStatus(8);

    pub fn describe(&self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "invalid parameter",
            2 => "not found",
            3 => "out of memory",
            4 => "not supported",
            5 => "device error",
            6 => "bus error",
            7 => "stack error",
            8 => "internal error",
            _ => "unknown status",
        }
    }

    /// Maps the status onto the crate's error kinds. Codes without a direct
    /// counterpart go through `fallback`.
    pub(crate) fn into_error(self, fallback: fn(String) -> BleError) -> BleError {
        match self {
            NativeStatus::NOT_FOUND => BleError::NotFound(self.to_string()),
            NativeStatus::NOT_SUPPORTED => BleError::NotSupported(self.to_string()),
            _ => fallback(self.to_string()),
        }
    }
}

impl std::fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status {})", self.describe(), self.0)
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeStatus>;

/// Opaque connection handle owned by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Opaque adapter handle owned by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryService {
    pub uuid: Uuid,
    pub attr_handle_start: u16,
    pub attr_handle_end: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryCharacteristic {
    pub uuid: Uuid,
    pub handle: u16,
    pub value_handle: u16,
    /// Attribute protocol properties bit field
    pub properties: u8,
}

/// Advertisement fields the library can report for an address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryAdvertisement {
    pub service_data: Vec<(Uuid, Vec<u8>)>,
    /// Raw manufacturer-specific field, company identifier included
    pub manufacturer_data: Vec<u8>,
    pub service_uuids: Vec<Uuid>,
}

/// Called by the library for each discovered device with its address and
/// name. Runs on a library thread.
pub type DiscoveredCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Called by the library when a connection drops. Runs on a library thread.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Connection options bit field.
pub const OPTIONS_BDADDR_LE_PUBLIC: u32 = 1 << 0;
pub const OPTIONS_BDADDR_LE_RANDOM: u32 = 1 << 1;
pub const OPTIONS_SEC_LOW: u32 = 1 << 2;
pub const OPTIONS_DEFAULT: u32 = OPTIONS_BDADDR_LE_PUBLIC | OPTIONS_BDADDR_LE_RANDOM | OPTIONS_SEC_LOW;

/// The synchronous library surface. Every call may block the calling thread.
pub trait GattLibrary: Send + Sync + 'static {
    fn connect(&self, adapter: &str, address: &str, options: u32) -> NativeResult<ConnectionId>;

    fn disconnect(&self, connection: ConnectionId) -> NativeResult<()>;

    fn discover_primary(&self, connection: ConnectionId) -> NativeResult<Vec<PrimaryService>>;

    fn discover_characteristics(&self, connection: ConnectionId) -> NativeResult<Vec<LibraryCharacteristic>>;

    fn read_char_by_uuid(&self, connection: ConnectionId, uuid: Uuid) -> NativeResult<Vec<u8>>;

    fn write_char_by_uuid(&self, connection: ConnectionId, uuid: Uuid, data: &[u8]) -> NativeResult<()>;

    fn write_without_response_char_by_uuid(
        &self,
        connection: ConnectionId,
        uuid: Uuid,
        data: &[u8],
    ) -> NativeResult<()>;

    /// Older library builds have no disconnect hook.
    fn register_on_disconnect(&self, connection: ConnectionId, callback: DisconnectCallback) -> NativeResult<()> {
        let _ = (connection, callback);
        Err(NativeStatus::NOT_SUPPORTED)
    }

    fn adapter_open(&self, name: &str) -> NativeResult<AdapterId>;

    fn adapter_close(&self, adapter: AdapterId) -> NativeResult<()>;

    /// Starts scanning; `callback` stays registered until `scan_disable`.
    fn scan_enable(&self, adapter: AdapterId, callback: DiscoveredCallback) -> NativeResult<()>;

    fn scan_disable(&self, adapter: AdapterId) -> NativeResult<()>;

    fn advertisement_data(&self, adapter: AdapterId, address: &str) -> NativeResult<LibraryAdvertisement>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted library used by the backend tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockLibrary {
        pub services: Mutex<Vec<PrimaryService>>,
        pub characteristics: Mutex<Vec<LibraryCharacteristic>>,
        pub values: Mutex<HashMap<Uuid, Vec<u8>>>,
        /// (uuid, data, with_response)
        pub writes: Mutex<Vec<(Uuid, Vec<u8>, bool)>>,
        pub calls: Mutex<Vec<&'static str>>,
        pub failures: Mutex<HashMap<&'static str, NativeStatus>>,
        pub advertisements: Mutex<HashMap<String, LibraryAdvertisement>>,
        pub on_disconnect: Mutex<Option<DisconnectCallback>>,
        pub discovered: Mutex<Option<DiscoveredCallback>>,
        pub disconnect_hook: bool,
    }

    impl MockLibrary {
        fn record(&self, call: &'static str) -> NativeResult<()> {
            self.calls.lock().unwrap().push(call);
            match self.failures.lock().unwrap().remove(call) {
                Some(status) => Err(status),
                None => Ok(()),
            }
        }

        pub fn fail(&self, call: &'static str, status: NativeStatus) {
            self.failures.lock().unwrap().insert(call, status);
        }

        pub fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, call: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
        }

        /// Simulates the library thread reporting a device.
        pub fn discover(&self, address: &str, name: Option<&str>) {
            let callback = self.discovered.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(address, name);
            }
        }

        /// Simulates the library reporting a dropped link.
        pub fn drop_link(&self) {
            let callback = self.on_disconnect.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    impl GattLibrary for MockLibrary {
        fn connect(&self, _adapter: &str, _address: &str, _options: u32) -> NativeResult<ConnectionId> {
            self.record("connect")?;
            Ok(ConnectionId(7))
        }

        fn disconnect(&self, _connection: ConnectionId) -> NativeResult<()> {
            self.record("disconnect")
        }

        fn discover_primary(&self, _connection: ConnectionId) -> NativeResult<Vec<PrimaryService>> {
            self.record("discover_primary")?;
            Ok(self.services.lock().unwrap().clone())
        }

        fn discover_characteristics(&self, _connection: ConnectionId) -> NativeResult<Vec<LibraryCharacteristic>> {
            self.record("discover_characteristics")?;
            Ok(self.characteristics.lock().unwrap().clone())
        }

        fn read_char_by_uuid(&self, _connection: ConnectionId, uuid: Uuid) -> NativeResult<Vec<u8>> {
            self.record("read")?;
            self.values.lock().unwrap().get(&uuid).cloned().ok_or(NativeStatus::NOT_FOUND)
        }

        fn write_char_by_uuid(&self, _connection: ConnectionId, uuid: Uuid, data: &[u8]) -> NativeResult<()> {
            self.record("write")?;
            self.writes.lock().unwrap().push((uuid, data.to_vec(), true));
            Ok(())
        }

        fn write_without_response_char_by_uuid(
            &self,
            _connection: ConnectionId,
            uuid: Uuid,
            data: &[u8],
        ) -> NativeResult<()> {
            self.record("write_without_response")?;
            self.writes.lock().unwrap().push((uuid, data.to_vec(), false));
            Ok(())
        }

        fn register_on_disconnect(&self, _connection: ConnectionId, callback: DisconnectCallback) -> NativeResult<()> {
            if !self.disconnect_hook {
                return Err(NativeStatus::NOT_SUPPORTED);
            }
            *self.on_disconnect.lock().unwrap() = Some(callback);
            Ok(())
        }

        fn adapter_open(&self, _name: &str) -> NativeResult<AdapterId> {
            self.record("adapter_open")?;
            Ok(AdapterId(1))
        }

        fn adapter_close(&self, _adapter: AdapterId) -> NativeResult<()> {
            self.record("adapter_close")
        }

        fn scan_enable(&self, _adapter: AdapterId, callback: DiscoveredCallback) -> NativeResult<()> {
            self.record("scan_enable")?;
            *self.discovered.lock().unwrap() = Some(callback);
            Ok(())
        }

        fn scan_disable(&self, _adapter: AdapterId) -> NativeResult<()> {
            self.record("scan_disable")?;
            *self.discovered.lock().unwrap() = None;
            Ok(())
        }

        fn advertisement_data(&self, _adapter: AdapterId, address: &str) -> NativeResult<LibraryAdvertisement> {
            self.advertisements
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or(NativeStatus::NOT_FOUND)
        }
    }
}
