use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, DEFAULT_ADAPTER, DEFAULT_CONNECT_TIMEOUT_SECS,
    DISCOVERY_TIMEOUT_SECS, EVENT_CHANNEL_CAPACITY, MAX_DISCOVERY_ATTEMPTS,
};
use crate::error::{BleError, Result};

/// Timeouts and sizing for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Used by callers that have no explicit connect timeout of their own
    pub connect_timeout_secs: u64,
    /// Read, write, subscribe and descriptor operations
    pub operation_timeout_secs: u64,
    /// One full service/characteristic/descriptor pass
    pub discovery_timeout_secs: u64,
    pub max_discovery_attempts: u32,
    pub event_channel_capacity: usize,
    /// Adapter the bus and native transports bind to
    pub adapter: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            operation_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            discovery_timeout_secs: DISCOVERY_TIMEOUT_SECS,
            max_discovery_attempts: MAX_DISCOVERY_ATTEMPTS,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
            adapter: DEFAULT_ADAPTER.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            return Err(BleError::Config("event_channel_capacity must be positive".to_string()));
        }
        if self.max_discovery_attempts == 0 {
            return Err(BleError::Config("max_discovery_attempts must be positive".to_string()));
        }
        if self.operation_timeout_secs == 0 || self.discovery_timeout_secs == 0 {
            return Err(BleError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }
}
