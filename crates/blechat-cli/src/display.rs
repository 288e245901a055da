//! Plain-text rendering of runtime events and snapshots

use std::fmt::Write as _;

use blechat_core::{
    session::WriteOutcome, ChatMessage, Direction, DiscoveredPeer, ServiceKind,
};
use blechat_runtime::{AppEvent, Snapshot};

pub fn message(message: &ChatMessage) -> String {
    match message.direction {
        Direction::FromLocal => format!("> {}", message.text),
        Direction::FromPeer => format!("< {}", message.text),
    }
}

pub fn peers(peers: &[DiscoveredPeer]) -> String {
    if peers.is_empty() {
        return "no peers discovered\n".to_string();
    }
    let mut out = String::new();
    for (index, peer) in peers.iter().enumerate() {
        let _ = writeln!(out, "[{}] {}", index, peer);
    }
    out
}

pub fn log(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return "no messages yet\n".to_string();
    }
    messages
        .iter()
        .map(|m| message(m) + "\n")
        .collect()
}

pub fn status(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "role:        {}", snapshot.role);
    let _ = writeln!(out, "client:      {}", snapshot.client_state);
    if let Some(peer) = &snapshot.server_peer {
        let _ = writeln!(out, "serving:     {}", peer);
    }
    let _ = writeln!(
        out,
        "scanning:    {} (signal filter {})",
        if snapshot.scanning { "yes" } else { "no" },
        if snapshot.rssi_filter { "on" } else { "off" }
    );
    if !snapshot.environment.all_met() {
        let _ = writeln!(out, "bluetooth:   unavailable");
    }
    for (kind, state) in &snapshot.bindings {
        let _ = writeln!(out, "{:<12} {}", format!("{}:", kind), state);
    }
    let _ = writeln!(
        out,
        "peers:       {}  messages: {}",
        snapshot.peers.len(),
        snapshot.messages.len()
    );
    out
}

/// One line for the chat view, or `None` for events only worth logging
pub fn render_event(event: &AppEvent) -> Option<String> {
    let line = match event {
        AppEvent::RoleChanged(role) => format!("* role: {}", role),
        AppEvent::SessionState { kind, change } if *kind == ServiceKind::GattClient => {
            match &change.reason {
                Some(reason) => format!("* client {} ({})", change.state, reason),
                None => format!("* client {}", change.state),
            }
        }
        AppEvent::ScanStatus(true) => "* scanning".to_string(),
        AppEvent::ScanStatus(false) => "* scan stopped".to_string(),
        AppEvent::PeerDiscovered { index, peer } => format!("* [{}] {}", index, peer),
        AppEvent::PeersReset => "* peer list cleared".to_string(),
        AppEvent::ServerPeerConnected(peer) => format!("* {} connected", peer),
        AppEvent::ServerPeerDisconnected(peer) => format!("* {} disconnected", peer),
        AppEvent::ServerPeerRejected(peer) => {
            format!("* {} tried to connect while we are a client", peer)
        }
        AppEvent::MessageReceived(received) => message(received),
        AppEvent::MessageSent(sent) => message(sent),
        AppEvent::SendFailed { text, outcome } => match outcome {
            WriteOutcome::TooLong => format!("! too long, not sent: {}", text),
            _ => format!("! not sent: {}", text),
        },
        AppEvent::Rejected(reason) => format!("! {}", reason),
        AppEvent::BindFailed { kind, reason } => format!("! {} unavailable: {}", kind, reason),
        AppEvent::Stopped => "* stopped".to_string(),
        AppEvent::BindingChanged { .. }
        | AppEvent::SessionState { .. }
        | AppEvent::PeerUpdated { .. } => return None,
    };
    Some(line)
}
