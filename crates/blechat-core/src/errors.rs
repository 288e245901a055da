//! Error types for blechat sessions
//!
//! [`SessionError`] is the failure taxonomy of a single session. Local
//! validation failures are returned synchronously; radio, timeout and peer
//! failures only ever travel as the `reason` of a state-change notice.

use thiserror::Error;

use crate::types::{ConnectionBindingState, ConnectionRole, ServiceKind, ServiceState};

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Rejected locally, the radio was never touched
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A platform call completed with a non-success status
    #[error("Radio rejected the request with status {status}")]
    RadioRejected { status: i32 },

    #[error("No radio callback within the bounded wait")]
    Timeout,

    /// The link dropped without a clean status
    #[error("Peer stopped responding")]
    PeerUnresponsive,

    /// The expected service or characteristic is absent after discovery
    #[error("Protocol mismatch: {missing} not found")]
    ProtocolMismatch { missing: &'static str },

    #[error("Session is not running")]
    NotRunning,

    #[error("A write is already in flight")]
    Busy,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServiceState,
    },
}

impl SessionError {
    /// Errors that the client resilience machine retries automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Timeout | SessionError::PeerUnresponsive)
    }
}

// ----------------------------------------------------------------------------
// Orchestrator Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("Already serving a connected client")]
    AlreadyServing,

    #[error("Already connected to a server")]
    AlreadyConnected,

    #[error("Already connecting to a server")]
    AlreadyConnecting,

    #[error("GATT client cannot connect now ({state})")]
    ClientBusy { state: ServiceState },

    #[error("GATT client binding is {binding}")]
    BindingBusy { binding: ConnectionBindingState },

    #[error("No active peer to send to")]
    NoActivePeer,

    #[error("Radio, location or permissions are not available")]
    EnvironmentNotReady,

    #[error("Missing hardware capability: {capability}")]
    Unsupported { capability: &'static str },

    #[error("Connection role already held: {held}")]
    RoleHeld { held: ConnectionRole },

    #[error("Peer index {index} out of range")]
    UnknownPeer { index: usize },
}

// ----------------------------------------------------------------------------
// Binding Transition Errors
// ----------------------------------------------------------------------------

/// A binding transition the orchestrator refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransitionError {
    pub service: ServiceKind,
    pub from: ConnectionBindingState,
    pub to: ConnectionBindingState,
}

impl core::fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Invalid {} binding transition from {} to {}",
            self.service, self.from, self.to
        )
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BlechatError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("State transition error: {0}")]
    Transition(#[from] StateTransitionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_and_unresponsive_are_retryable() {
        assert!(SessionError::Timeout.is_retryable());
        assert!(SessionError::PeerUnresponsive.is_retryable());
        assert!(!SessionError::ProtocolMismatch { missing: "service" }.is_retryable());
        assert!(!SessionError::RadioRejected { status: 133 }.is_retryable());
    }

    #[test]
    fn test_transition_error_display() {
        let err = StateTransitionError {
            service: ServiceKind::GattClient,
            from: ConnectionBindingState::Connected,
            to: ConnectionBindingState::Connecting,
        };
        assert_eq!(
            err.to_string(),
            "Invalid gatt-client binding transition from Connected to Connecting"
        );
    }
}
