//! Bluetooth session engine
//! This module turns the events of a native Bluetooth stack into one
//! consistent client API: scanning with advertisement aggregation, connection
//! lifecycle, GATT tree resolution and notification routing.

pub mod aggregator;
pub mod backends;
pub mod constants;
pub mod gatt;
pub mod lifecycle;
pub mod notification;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use aggregator::{AdvertisementAggregator, AdvertisementRecord, AdvertisementUpdate};
pub use constants::*; // Re-export all constants
pub use gatt::{Characteristic, Descriptor, GattTree, Orphan, Service, TreeResolver};
pub use lifecycle::{ConnectionState, LinkState};
pub use notification::{Delivery, NotificationRouter, NotifyCallback};
pub use scanner::{ScanCallback, Scanner};
pub use session::{DisconnectedCallback, Session};
pub use transport::{
    Capabilities, ConnectAttempts, DisconnectReason, EventSender, HandleRange, RawCharacteristic, RawDescriptor,
    RawService, ScanSink, ScanTransport, Transport, TransportEvent,
};
pub use types::{
    AdvertisementData, CharacteristicProperties, CharacteristicRef, Device, RawSighting, ScanEvent,
};
