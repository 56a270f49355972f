//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::gatt::Characteristic;

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// The address of the device (MAC address, or a platform UUID string on delegate stacks)
    pub address: String,
    /// The name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the most recent sighting
    pub rssi: Option<i16>,
}

impl Device {
    /// Creates a new Device instance
    pub fn new(address: String, name: Option<String>, rssi: Option<i16>) -> Self {
        Self { address, name, rssi }
    }

    /// Returns the name, or "Unknown" when the device never reported one
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Advertisement payload merged from every sighting of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    /// Company identifier to payload
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
}

/// One sighting as delivered by a scan transport.
/// Every field is optional because native callbacks often report a partial
/// subset of the advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSighting {
    pub address: Option<String>,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Option<HashMap<u16, Vec<u8>>>,
    pub service_data: Option<HashMap<Uuid, Vec<u8>>>,
    pub service_uuids: Option<Vec<Uuid>>,
}

impl RawSighting {
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

/// Splits a raw manufacturer-specific advertisement payload into its company
/// identifier (first two bytes, little endian) and the remaining bytes.
pub fn parse_manufacturer_data(raw: &[u8]) -> Option<(u16, Vec<u8>)> {
    match raw {
        [lo, hi, rest @ ..] => Some((u16::from_le_bytes([*lo, *hi]), rest.to_vec())),
        _ => None,
    }
}

/// Messages travelling from a scan transport to the scanner task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Sighting(RawSighting),
    /// The stack forgot about a device (bus `InterfacesRemoved`)
    Removed(String),
}

/// Operations a characteristic supports, as reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
}

impl CharacteristicProperties {
    /// Decodes the attribute protocol properties bit field.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            broadcast: bits & 0x01 != 0,
            read: bits & 0x02 != 0,
            write_without_response: bits & 0x04 != 0,
            write: bits & 0x08 != 0,
            notify: bits & 0x10 != 0,
            indicate: bits & 0x20 != 0,
            authenticated_signed_writes: bits & 0x40 != 0,
            extended_properties: bits & 0x80 != 0,
        }
    }

    /// Decodes the flag strings the bus stack reports (`"read"`, `"notify"`, ...).
    /// Unknown flags are ignored.
    pub fn from_flags<S: AsRef<str>>(flags: &[S]) -> Self {
        let mut props = Self::default();
        for flag in flags {
            match flag.as_ref() {
                "broadcast" => props.broadcast = true,
                "read" => props.read = true,
                "write-without-response" => props.write_without_response = true,
                "write" => props.write = true,
                "notify" => props.notify = true,
                "indicate" => props.indicate = true,
                "authenticated-signed-writes" => props.authenticated_signed_writes = true,
                "extended-properties" => props.extended_properties = true,
                _ => {}
            }
        }
        props
    }

    /// True when the characteristic can push values (notify or indicate).
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// The ways a caller can name a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicRef {
    /// Attribute handle; the exact identity.
    Handle(u16),
    /// First characteristic with this UUID in handle order.
    Uuid(Uuid),
}

impl From<u16> for CharacteristicRef {
    fn from(handle: u16) -> Self {
        CharacteristicRef::Handle(handle)
    }
}

impl From<Uuid> for CharacteristicRef {
    fn from(uuid: Uuid) -> Self {
        CharacteristicRef::Uuid(uuid)
    }
}

impl From<&Characteristic> for CharacteristicRef {
    fn from(characteristic: &Characteristic) -> Self {
        CharacteristicRef::Handle(characteristic.handle)
    }
}

impl std::fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CharacteristicRef::Handle(handle) => write!(f, "handle 0x{:04x}", handle),
            CharacteristicRef::Uuid(uuid) => write!(f, "uuid {}", uuid),
        }
    }
}
