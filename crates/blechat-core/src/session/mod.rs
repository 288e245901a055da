//! The four radio-backed sessions
//!
//! Each session owns its [`ServiceState`] and its [`Generation`](crate::Generation).
//! Inputs tagged with a stale generation are dropped before they reach the
//! transition logic.

pub mod advertiser;
pub mod gatt_client;
pub mod gatt_server;
pub mod scanner;

use crate::errors::SessionError;
use crate::types::ServiceState;

pub use advertiser::{Advertiser, AdvertiserCommand, AdvertiserEvent, AdvertiserNotice};
pub use gatt_client::{
    GattClient, GattClientCommand, GattClientEvent, GattClientNotice, LinkState, RetryBudget,
    WriteOutcome,
};
pub use gatt_server::{GattServer, GattServerCommand, GattServerEvent, GattServerNotice};
pub use scanner::{
    FilterMode, PeerRegistry, ScanMode, ScanReport, Scanner, ScannerCommand, ScannerEvent,
    ScannerNotice,
};

/// A reported lifecycle transition
///
/// Radio, timeout and peer failures reach the owner only as the `reason` of
/// the transition they caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: ServiceState,
    pub reason: Option<SessionError>,
}

impl StateChange {
    pub fn new(state: ServiceState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn because(state: ServiceState, reason: SessionError) -> Self {
        Self {
            state,
            reason: Some(reason),
        }
    }
}
