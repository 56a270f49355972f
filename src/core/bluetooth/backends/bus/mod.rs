//! Message-bus backend.
//!
//! The stack is a system service exposing every adapter, device and GATT
//! attribute as an object on a message bus. This module defines the small
//! slice of that bus the transport needs; the bus binding itself is supplied
//! by the embedding application through [`BusConnection`].

mod client;
mod scanner;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BleError;

pub use client::BusTransport;
pub use scanner::BusScanner;

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusValue {
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Str(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
    /// `a{qv}` keyed by company identifier
    ManufacturerData(HashMap<u16, Vec<u8>>),
    /// `a{sv}` keyed by service UUID string
    ServiceData(HashMap<String, Vec<u8>>),
    Dict(PropertyMap),
}

pub type PropertyMap = BTreeMap<String, BusValue>;

/// interface name -> properties
pub type InterfaceMap = BTreeMap<String, PropertyMap>;

/// object path -> interfaces
pub type ManagedObjects = BTreeMap<String, InterfaceMap>;

/// A method call on a bus object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRequest {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<BusValue>,
}

impl BusRequest {
    pub fn new(path: impl Into<String>, interface: &str, member: &str) -> Self {
        Self {
            destination: crate::core::bluetooth::constants::BLUEZ_SERVICE.to_string(),
            path: path.into(),
            interface: interface.to_string(),
            member: member.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: BusValue) -> Self {
        self.args.push(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusReply {
    Empty,
    Bytes(Vec<u8>),
    ManagedObjects(ManagedObjects),
}

/// An error reply, e.g. `org.bluez.Error.NotPermitted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    pub name: String,
    pub message: String,
}

impl BusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusBody {
    InterfacesAdded {
        object: String,
        interfaces: InterfaceMap,
    },
    InterfacesRemoved {
        object: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        interface: String,
        changed: PropertyMap,
        invalidated: Vec<String>,
    },
}

/// A signal delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub interface: String,
    pub member: String,
    pub path: String,
    pub body: BusBody,
}

/// Invoked on the bus's own thread for every signal. Must not block.
pub type SignalHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// The bus binding.
#[async_trait]
pub trait BusConnection: Send + Sync + 'static {
    async fn call(&self, request: BusRequest) -> std::result::Result<BusReply, BusError>;

    /// Starts delivering signals to `handler`. Returns a subscription id.
    fn subscribe(&self, handler: SignalHandler) -> u64;

    fn unsubscribe(&self, id: u64);
}

/// Maps bus error names onto the crate's error kinds.
pub(crate) fn translate(error: BusError, fallback: fn(String) -> BleError) -> BleError {
    let kind = error.name.rsplit('.').next().unwrap_or_default();
    match kind {
        "NotConnected" => BleError::NotConnected,
        "NotSupported" => BleError::NotSupported(error.message),
        "DoesNotExist" | "UnknownObject" => BleError::NotFound(error.message),
        "NoReply" | "Timeout" | "TimedOut" => BleError::Timeout,
        _ => fallback(error.to_string()),
    }
}

/// Attribute handle encoded in the last four hex digits of an object path
/// (`.../service000a/char000b`).
pub(crate) fn handle_from_path(path: &str) -> Option<u16> {
    let suffix = path.get(path.len().checked_sub(4)?..)?;
    u16::from_str_radix(suffix, 16).ok()
}

pub(crate) fn prop_str<'a>(props: &'a PropertyMap, key: &str) -> Option<&'a str> {
    match props.get(key) {
        Some(BusValue::Str(s)) | Some(BusValue::ObjectPath(s)) => Some(s),
        _ => None,
    }
}

pub(crate) fn prop_bool(props: &PropertyMap, key: &str) -> Option<bool> {
    match props.get(key) {
        Some(BusValue::Bool(b)) => Some(*b),
        _ => None,
    }
}

pub(crate) fn prop_uuid(props: &PropertyMap, key: &str) -> Option<Uuid> {
    prop_str(props, key).and_then(|s| Uuid::parse_str(s).ok())
}
