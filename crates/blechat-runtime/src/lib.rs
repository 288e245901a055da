//! blechat Runtime
//!
//! Runs the sans-IO sessions from `blechat-core` on tokio:
//! - One driver task per session, owning its state machine, radio link,
//!   timers and handle lease
//! - `SupervisorTask`: executes orchestrator directives, maintains the chat
//!   log and the discovered peers, and reports [`AppEvent`]s
//! - `RuntimeBuilder`: the entry point for the CLI and for tests
//!
//! The platform radio is reached only through [`RadioAdapter`]; see
//! `blechat-ble` for the BlueZ/btleplug implementation and [`testing`] for a
//! scripted one.

pub mod builder;
pub mod channel;
pub mod drivers;
pub mod error;
pub mod radio;
pub mod supervisor;
pub mod testing;
pub mod timers;

pub use builder::{RuntimeBuilder, RuntimeHandle};
pub use channel::{AppEvent, ChatCommand, Snapshot};
pub use drivers::{
    AdvertiserHandle, GattClientHandle, GattServerHandle, ScannerHandle, SessionNotice,
};
pub use error::{RadioError, Result, RuntimeError};
pub use radio::{
    AdvertiserLink, EventSink, GattClientLink, GattServerLink, Lease, RadioAdapter, RadioLeases,
    RadioLink, ScannerLink, Tagged,
};
pub use supervisor::{ChatSettings, SupervisorTask};
pub use timers::TimerSet;

// Re-export core types for convenience
pub use blechat_core::{
    orchestrator::{Capabilities, Environment},
    session::{FilterMode, ScanMode, StateChange, WriteOutcome},
    ChatMessage, ConnectionBindingState, ConnectionRole, DiscoveredPeer, Direction,
    OrchestratorError, PeerAddress, ServiceKind, ServiceState, SessionConfig, SessionError,
};
