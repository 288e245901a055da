//! Channel types between the application and the supervisor

use blechat_core::{
    orchestrator::Environment,
    session::{ScanMode, StateChange, WriteOutcome},
    ChatMessage, ConnectionBindingState, ConnectionRole, DiscoveredPeer, OrchestratorError,
    PeerAddress, ServiceKind, ServiceState,
};
use tokio::sync::oneshot;

// ----------------------------------------------------------------------------
// ChatCommand: Application → Supervisor
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub enum ChatCommand {
    /// Connect to the peer at this index of the discovered list
    SelectPeer(usize),
    /// Send a chat message over whichever role is active
    Send(String),
    /// Start scanning, optionally switching the scan mode
    StartScan(Option<ScanMode>),
    StopScan,
    /// Toggle the signal-strength filter
    SetRssiFilter(bool),
    /// Forget every discovered peer
    ResetPeers,
    UpdateAdvertisement(Vec<u8>),
    SetEnvironment(Environment),
    /// Disconnect the client session, if any
    Disconnect,
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

// ----------------------------------------------------------------------------
// AppEvent: Supervisor → Application
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    BindingChanged {
        kind: ServiceKind,
        state: ConnectionBindingState,
    },
    RoleChanged(ConnectionRole),
    SessionState {
        kind: ServiceKind,
        change: StateChange,
    },
    ScanStatus(bool),
    PeerDiscovered {
        index: usize,
        peer: DiscoveredPeer,
    },
    PeerUpdated {
        index: usize,
        peer: DiscoveredPeer,
    },
    PeersReset,
    ServerPeerConnected(PeerAddress),
    ServerPeerDisconnected(PeerAddress),
    /// A handshake arrived while acting as client
    ServerPeerRejected(PeerAddress),
    MessageReceived(ChatMessage),
    MessageSent(ChatMessage),
    SendFailed {
        text: String,
        outcome: WriteOutcome,
    },
    /// A command was refused
    Rejected(OrchestratorError),
    /// A session could not be bound
    BindFailed {
        kind: ServiceKind,
        reason: String,
    },
    Stopped,
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub role: ConnectionRole,
    pub client_state: ServiceState,
    pub bindings: Vec<(ServiceKind, ConnectionBindingState)>,
    pub scanning: bool,
    pub rssi_filter: bool,
    pub server_peer: Option<PeerAddress>,
    pub environment: Environment,
    pub peers: Vec<DiscoveredPeer>,
    pub messages: Vec<ChatMessage>,
}
