use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{MIN_RSSI_THRESHOLD, SCAN_CHANNEL_CAPACITY};
use crate::error::{BleError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub scan_channel_capacity: usize,
    /// Sightings weaker than this (dBm) are ignored
    pub rssi_threshold: i16,
    /// Skip callbacks for sightings that changed nothing but RSSI
    pub suppress_unchanged: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_channel_capacity: SCAN_CHANNEL_CAPACITY,
            rssi_threshold: MIN_RSSI_THRESHOLD,
            suppress_unchanged: false,
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scan_channel_capacity == 0 {
            return Err(BleError::Config("scan_channel_capacity must be positive".to_string()));
        }
        Ok(())
    }
}
