//! Constants used throughout the crate
//! This module contains default timeouts, channel sizes and the well-known
//! UUIDs and object-model names the transports rely on.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_GENERIC_ATTRIBUTE_SERVICE: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_SERVICE_CHANGED: Uuid = Uuid::from_u128(0x00002a05_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor
pub const UUID_CLIENT_CHARACTERISTIC_CONFIG: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Timeout for establishing a connection in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for request/response GATT operations in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Timeout for the full service/characteristic discovery in seconds
pub const DISCOVERY_TIMEOUT_SECS: u64 = 5;

/// How many times discovery restarts when the services change mid-flight
pub const MAX_DISCOVERY_ATTEMPTS: u32 = 3;

/// Capacity of the push-event channel between a transport and its session
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the sighting channel between a scan transport and the scanner
pub const SCAN_CHANNEL_CAPACITY: usize = 512;

/// Minimum RSSI threshold for a sighting to be considered (dBm)
pub const MIN_RSSI_THRESHOLD: i16 = -100;

/// Default adapter name on bus and native-library stacks
pub const DEFAULT_ADAPTER: &str = "hci0";

/// Bus object model names
pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const GATT_SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
