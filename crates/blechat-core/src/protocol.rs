//! Wire-level constants and the shapes of what goes over the air

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SessionError;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Chat service, used for scan filtering and GATT discovery
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Peer to server, write-only
pub const INBOUND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Server to peer, read + notify
pub const OUTBOUND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

// ----------------------------------------------------------------------------
// Handshake and Limits
// ----------------------------------------------------------------------------

/// Written once by the client after discovery; its receipt promotes a raw
/// connection to the application peer
pub const HANDSHAKE_TOKEN: &str = "blechat:hello";

/// Hard cap on a chat message, in UTF-8 bytes
pub const MAX_MESSAGE_BYTES: usize = 300;

/// MTU the client asks for after connecting
pub const REQUEST_MTU: u16 = 512;

pub const DEFAULT_DEVICE_NAME: &str = "blechat";

pub const DEFAULT_ADVERTISING_PAYLOAD: &str = "blechat";

/// Reject texts whose UTF-8 encoding exceeds `max` bytes
pub fn check_message_size(text: &str, max: usize) -> Result<(), SessionError> {
    let size = text.len();
    if size > max {
        return Err(SessionError::PayloadTooLarge { size, max });
    }
    Ok(())
}

/// Reject advertising payloads that are not strictly shorter than `max`
pub fn check_advertising_size(payload: &[u8], max: usize) -> Result<(), SessionError> {
    if payload.len() >= max {
        return Err(SessionError::PayloadTooLarge {
            size: payload.len(),
            max: max.saturating_sub(1),
        });
    }
    Ok(())
}

/// Decode a characteristic value, replacing invalid sequences
pub fn decode_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

// ----------------------------------------------------------------------------
// Advertising
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisingInterval {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPower {
    UltraLow,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Parameters of the advertisement set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingParameters {
    pub legacy: bool,
    pub connectable: bool,
    pub interval: AdvertisingInterval,
    pub tx_power: TxPower,
    pub primary_phy: Phy,
    pub secondary_phy: Phy,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        Self {
            legacy: false,
            connectable: true,
            interval: AdvertisingInterval::Medium,
            tx_power: TxPower::High,
            primary_phy: Phy::Le1M,
            secondary_phy: Phy::LeCoded,
        }
    }
}

/// Data carried by the advertisement set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub include_device_name: bool,
    pub service_uuid: Uuid,
    /// Attached as service data under `service_uuid`
    pub service_data: Vec<u8>,
}

impl AdvertisementData {
    pub fn for_chat(payload: Vec<u8>) -> Self {
        Self {
            include_device_name: true,
            service_uuid: SERVICE_UUID,
            service_data: payload,
        }
    }
}

// ----------------------------------------------------------------------------
// GATT Service Layout
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// The primary service the GATT server publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    pub fn chat() -> Self {
        Self {
            uuid: SERVICE_UUID,
            characteristics: vec![
                CharacteristicDefinition {
                    uuid: INBOUND_CHARACTERISTIC_UUID,
                    properties: CharacteristicProperties {
                        read: false,
                        write: true,
                        notify: false,
                    },
                },
                CharacteristicDefinition {
                    uuid: OUTBOUND_CHARACTERISTIC_UUID,
                    properties: CharacteristicProperties {
                        read: true,
                        write: false,
                        notify: true,
                    },
                },
            ],
        }
    }
}

/// A service as reported by GATT discovery on the client side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}
