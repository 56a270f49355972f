//! Core functionality of the BLE bridge
//! This module contains the session engine and the transports it drives.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{Scanner, Session};
