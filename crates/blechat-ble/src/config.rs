//! BLE radio configuration

use blechat_core::protocol::DEFAULT_DEVICE_NAME;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Which adapter to use and how the local device presents itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Position in the platform's adapter list
    pub adapter_index: usize,
    /// Local name included in the advertisement
    pub device_name: String,
    /// Largest advertising data the controller accepts, in bytes
    pub max_advertising_data_len: usize,
    /// Power the adapter on when it is found switched off (BlueZ only)
    pub power_on: bool,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            max_advertising_data_len: 31, // Legacy advertising PDU
            power_on: false,
        }
    }
}

impl BleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the adapter by position
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the advertising data limit reported as a capability
    pub fn with_max_advertising_data_len(mut self, len: usize) -> Self {
        self.max_advertising_data_len = len;
        self
    }

    pub fn with_power_on(mut self, enabled: bool) -> Self {
        self.power_on = enabled;
        self
    }
}
