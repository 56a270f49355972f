//! BLE bridge library
//! A BLE client session engine that drives bus, delegate and native-library
//! Bluetooth stacks through one connect / discover / read / write / notify API.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use crate::config::AppConfig;
pub use crate::core::bluetooth::{
    AdvertisementData, CharacteristicRef, ConnectionState, Device, GattTree, Scanner, Session,
};
pub use crate::error::{BleError, Result};
