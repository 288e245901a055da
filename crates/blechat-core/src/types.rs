//! Core types shared by every session
//!
//! Newtypes for addresses, generations and timestamps plus the lifecycle enums
//! reported by sessions and tracked by the orchestrator.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Peer Address
// ----------------------------------------------------------------------------

/// Opaque hardware address of a remote device
///
/// The radio decides the format. On BlueZ and btleplug it is the usual
/// colon-separated MAC string; tests use whatever is convenient.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ----------------------------------------------------------------------------
// Generation
// ----------------------------------------------------------------------------

/// Monotonic counter identifying one incarnation of a session's radio work
///
/// Sessions bump it on every connect attempt, scan start and teardown. Inputs
/// carrying any other generation are stale and must be ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    pub const INITIAL: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Advance to the next generation and return it
    pub fn bump(&mut self) -> Self {
        self.0 += 1;
        *self
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Radio Status
// ----------------------------------------------------------------------------

/// Status code attached to a radio callback
///
/// Zero is success, matching the GATT status convention. Everything else is a
/// platform-specific failure code that the core only logs and carries along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RadioStatus(pub i32);

impl RadioStatus {
    pub const SUCCESS: Self = Self(0);
    /// Generic failure used when the platform does not report a code
    pub const FAILURE: Self = Self(0x101);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl From<bool> for RadioStatus {
    fn from(ok: bool) -> Self {
        if ok {
            Self::SUCCESS
        } else {
            Self::FAILURE
        }
    }
}

// ----------------------------------------------------------------------------
// Service State
// ----------------------------------------------------------------------------

/// Lifecycle state reported by every session
///
/// `Idle -> Starting -> {Running | StartFailed}`,
/// `Running -> {Unhealthy -> Running | Stopping}`, `Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    #[default]
    Idle,
    Starting,
    Running,
    StartFailed,
    /// A retry is in flight
    Unhealthy,
    Stopping,
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Idle => "Idle",
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::StartFailed => "StartFailed",
            ServiceState::Unhealthy => "Unhealthy",
            ServiceState::Stopping => "Stopping",
            ServiceState::Stopped => "Stopped",
        }
    }

    /// Terminal states accept no further radio events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceState::StartFailed | ServiceState::Stopping | ServiceState::Stopped
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Service Kind
// ----------------------------------------------------------------------------

/// The four radio-backed services the orchestrator binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Advertiser,
    Scanner,
    GattServer,
    GattClient,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::Advertiser,
        ServiceKind::Scanner,
        ServiceKind::GattServer,
        ServiceKind::GattClient,
    ];

    /// Services that are bound whenever the environment allows it
    pub const ALWAYS_ON: [ServiceKind; 3] = [
        ServiceKind::Advertiser,
        ServiceKind::Scanner,
        ServiceKind::GattServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Advertiser => "advertiser",
            ServiceKind::Scanner => "scanner",
            ServiceKind::GattServer => "gatt-server",
            ServiceKind::GattClient => "gatt-client",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ServiceKind::Advertiser => 0,
            ServiceKind::Scanner => 1,
            ServiceKind::GattServer => 2,
            ServiceKind::GattClient => 3,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Connection Binding State
// ----------------------------------------------------------------------------

/// Orchestrator-side view of one service binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionBindingState {
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
    Unhealthy,
    /// Never bound since startup
    #[default]
    Waiting,
}

impl ConnectionBindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionBindingState::NotConnected => "NotConnected",
            ConnectionBindingState::Connecting => "Connecting",
            ConnectionBindingState::Connected => "Connected",
            ConnectionBindingState::Disconnecting => "Disconnecting",
            ConnectionBindingState::Unhealthy => "Unhealthy",
            ConnectionBindingState::Waiting => "Waiting",
        }
    }

    /// Whether a bind request may start from this state
    pub fn can_bind(&self) -> bool {
        matches!(
            self,
            ConnectionBindingState::NotConnected | ConnectionBindingState::Waiting
        )
    }
}

impl fmt::Display for ConnectionBindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Connection Role
// ----------------------------------------------------------------------------

/// Which side of the GATT link this device currently plays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionRole {
    #[default]
    None,
    Client,
    Server,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionRole::None => "none",
            ConnectionRole::Client => "client",
            ConnectionRole::Server => "server",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Discovered Peer
// ----------------------------------------------------------------------------

/// A device seen by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub address: PeerAddress,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Service data advertised under the chat service UUID, uninterpreted
    pub service_data: Vec<u8>,
}

impl fmt::Display for DiscoveredPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} dBm)", self.address, self.rssi)?;
        if !self.service_data.is_empty() {
            match core::str::from_utf8(&self.service_data) {
                Ok(text) => write!(f, " \"{}\"", text)?,
                Err(_) => write!(f, " 0x{}", hex::encode(&self.service_data))?,
            }
        }
        Ok(())
    }
}
