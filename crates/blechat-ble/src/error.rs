//! Error types for the BLE radio

use blechat_runtime::RadioError;
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE radio
#[derive(Error, Debug)]
pub enum BleError {
    #[error("btleplug: {0}")]
    Btleplug(#[from] btleplug::Error),

    #[cfg(target_os = "linux")]
    #[error("BlueZ: {0}")]
    Bluez(#[from] bluer::Error),

    #[error("No BLE adapter at index {index} ({available} available)")]
    AdapterNotFound { index: usize, available: usize },

    #[error("Peer not found: {address}")]
    PeerNotFound { address: String },

    #[error("No peer selected")]
    NoPeer,

    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: Uuid },

    #[error("No central is subscribed to notifications")]
    NotSubscribed,

    #[error("No GATT application is registered")]
    NoApplication,

    #[error("Peripheral role is not supported on this platform")]
    PeripheralUnsupported,
}

impl From<BleError> for RadioError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::AdapterNotFound { .. } => RadioError::Unavailable,
            other => RadioError::Platform(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BleError>;
