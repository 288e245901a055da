//! Core session logic for blechat
//!
//! This crate holds everything about a two-party BLE chat that can be decided
//! without touching a radio: the data model, protocol constants, the four
//! session state machines (advertiser, scanner, GATT server, GATT client) and
//! the orchestrator that binds them together.
//!
//! ## Architecture
//!
//! Every state machine is sans-IO. It consumes commands, radio events and timer
//! expirations, and answers with a list of [`Effect`]s: radio commands to
//! issue, timers to arm or cancel, and notices for its owner. The runtime crate
//! executes those effects and feeds results back in, one input at a time.
//!
//! Radio events and timers carry the [`Generation`] that was current when they
//! were issued. A session drops anything tagged with an older generation, so a
//! callback from a superseded connection attempt can never move the session.
//!
//! - [`protocol`] - UUIDs, handshake token, payload limits
//! - [`config`] - timings and limits shared by all sessions
//! - [`session`] - advertiser, scanner, GATT server, GATT client
//! - [`orchestrator`] - bindings, role register, auto-rebind
//! - [`chat`] - the append-only message log

pub mod chat;
pub mod config;
pub mod effects;
pub mod errors;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod types;

pub use chat::{ChatLog, ChatMessage, Direction};
pub use config::SessionConfig;
pub use effects::{Effect, TimerKind, TimerToken};
pub use errors::{BlechatError, ConfigError, OrchestratorError, SessionError, StateTransitionError};
pub use orchestrator::{
    Capabilities, Directive, Environment, Orchestrator, OrchestratorEvent, OrchestratorNotice,
    RoleRegister, SendRoute,
};
pub use protocol::{
    HANDSHAKE_TOKEN, INBOUND_CHARACTERISTIC_UUID, MAX_MESSAGE_BYTES, OUTBOUND_CHARACTERISTIC_UUID,
    SERVICE_UUID,
};
pub use types::{
    ConnectionBindingState, ConnectionRole, DiscoveredPeer, Generation, PeerAddress,
    RadioStatus, ServiceKind, ServiceState, Timestamp,
};

/// Result type for blechat operations
pub type Result<T> = core::result::Result<T, BlechatError>;
