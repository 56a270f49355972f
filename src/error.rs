//! Error taxonomy for the BLE session engine.
//! Transport status codes are translated into these variants at the
//! transport boundary and never leak past the session surface.

use thiserror::Error;

/// Errors returned by sessions, scanners and transports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    /// Native connect or disconnect failed.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Service or characteristic enumeration failed.
    #[error("Discovery error: {0}")]
    Discovery(String),
    /// The operation requires a connected session.
    #[error("Not connected")]
    NotConnected,
    /// The current transport cannot perform the operation.
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// No acknowledgment arrived in time.
    #[error("Operation timed out")]
    Timeout,
    /// A characteristic or descriptor reference does not resolve.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Scanner start/stop failure.
    #[error("Scan error: {0}")]
    Scan(String),
    /// A read or write was rejected by the peripheral or stack.
    #[error("GATT operation failed: {0}")]
    Gatt(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BleError {
    fn from(e: std::io::Error) -> Self {
        BleError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BleError {
    fn from(e: serde_json::Error) -> Self {
        BleError::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for BleError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BleError::Timeout
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BleError>;
