//! GATT server session
//!
//! Hosts the chat service. The first device that writes the handshake token to
//! the inbound characteristic becomes the application peer; every other write
//! to the inbound characteristic is an ordinary chat message.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::effects::Effect;
use crate::errors::SessionError;
use crate::protocol::{
    check_message_size, decode_text, ServiceDefinition, HANDSHAKE_TOKEN,
    INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID,
};
use crate::session::StateChange;
use crate::types::{Generation, PeerAddress, RadioStatus, ServiceState};

// ----------------------------------------------------------------------------
// Commands, Events, Notices
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum GattServerCommand {
    OpenServer,
    AddService(ServiceDefinition),
    SendResponse {
        device: PeerAddress,
        request_id: u32,
        status: RadioStatus,
        value: Option<Vec<u8>>,
    },
    /// Push `value` to `device` through the outbound characteristic
    NotifyPeer {
        device: PeerAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ClearServices,
    CloseServer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GattServerEvent {
    ServiceAdded {
        status: RadioStatus,
    },
    ConnectionStateChanged {
        device: PeerAddress,
        connected: bool,
    },
    WriteRequest {
        device: PeerAddress,
        request_id: u32,
        characteristic: Uuid,
        response_needed: bool,
        value: Vec<u8>,
    },
    ReadRequest {
        device: PeerAddress,
        request_id: u32,
        characteristic: Uuid,
    },
    NotificationSent {
        device: PeerAddress,
        status: RadioStatus,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GattServerNotice {
    StateChanged(StateChange),
    /// The device presented the handshake token
    ClientConnected(PeerAddress),
    ClientDisconnected(PeerAddress),
    MessageReceived { device: PeerAddress, text: String },
    Destroyed,
}

pub type GattServerEffect = Effect<GattServerCommand, GattServerNotice>;

// ----------------------------------------------------------------------------
// GATT Server
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct GattServer {
    state: ServiceState,
    generation: Generation,
    max_message_bytes: usize,
    /// Device that presented the handshake token
    peer: Option<PeerAddress>,
    /// Last value set on the outbound characteristic, served to reads
    outbound_value: Vec<u8>,
    destroyed: bool,
}

impl GattServer {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            state: ServiceState::Idle,
            generation: Generation::INITIAL,
            max_message_bytes,
            peer: None,
            outbound_value: Vec::new(),
            destroyed: false,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn peer(&self) -> Option<&PeerAddress> {
        self.peer.as_ref()
    }

    pub fn outbound_value(&self) -> &[u8] {
        &self.outbound_value
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Open the server and register the chat service
    pub fn start(&mut self) -> Result<Vec<GattServerEffect>, SessionError> {
        if self.destroyed || self.state != ServiceState::Idle {
            return Err(SessionError::InvalidState {
                operation: "start GATT server",
                state: self.state,
            });
        }
        self.generation.bump();
        let mut effects = self.enter(StateChange::new(ServiceState::Starting));
        effects.push(Effect::Radio(GattServerCommand::OpenServer));
        effects.push(Effect::Radio(GattServerCommand::AddService(
            ServiceDefinition::chat(),
        )));
        Ok(effects)
    }

    /// Prepare a notification of `text` to `device`
    ///
    /// Oversized texts fail before anything else is checked. The radio's
    /// acceptance of the resulting `NotifyPeer` is the caller's answer.
    pub fn send_to_peer(
        &mut self,
        device: &PeerAddress,
        text: &str,
    ) -> Result<Vec<GattServerEffect>, SessionError> {
        check_message_size(text, self.max_message_bytes)?;
        if self.state != ServiceState::Running {
            return Err(SessionError::NotRunning);
        }
        self.outbound_value = text.as_bytes().to_vec();
        Ok(vec![Effect::Radio(GattServerCommand::NotifyPeer {
            device: device.clone(),
            characteristic: OUTBOUND_CHARACTERISTIC_UUID,
            value: self.outbound_value.clone(),
        })])
    }

    pub fn handle_event(
        &mut self,
        generation: Generation,
        event: GattServerEvent,
    ) -> Vec<GattServerEffect> {
        if self.destroyed || generation != self.generation {
            debug!("Dropping stale GATT server event ({})", generation);
            return Vec::new();
        }

        match event {
            GattServerEvent::ServiceAdded { status } => self.on_service_added(status),
            GattServerEvent::ConnectionStateChanged { device, connected } => {
                self.on_connection_state(device, connected)
            }
            GattServerEvent::WriteRequest {
                device,
                request_id,
                characteristic,
                response_needed,
                value,
            } => self.on_write(device, request_id, characteristic, response_needed, value),
            GattServerEvent::ReadRequest {
                device,
                request_id,
                characteristic,
            } => {
                if characteristic != OUTBOUND_CHARACTERISTIC_UUID {
                    debug!("Ignoring read of {}", characteristic);
                    return Vec::new();
                }
                vec![Effect::Radio(GattServerCommand::SendResponse {
                    device,
                    request_id,
                    status: RadioStatus::SUCCESS,
                    value: Some(self.outbound_value.clone()),
                })]
            }
            GattServerEvent::NotificationSent { device, status } => {
                if !status.is_success() {
                    warn!("Notification to {} failed: status {}", device, status.0);
                }
                Vec::new()
            }
        }
    }

    fn on_service_added(&mut self, status: RadioStatus) -> Vec<GattServerEffect> {
        if self.state != ServiceState::Starting {
            return Vec::new();
        }
        if status.is_success() {
            info!("GATT service registered");
            self.enter(StateChange::new(ServiceState::Running))
        } else {
            warn!("GATT service registration failed: status {}", status.0);
            self.enter(StateChange::because(
                ServiceState::StartFailed,
                SessionError::RadioRejected { status: status.0 },
            ))
        }
    }

    fn on_connection_state(&mut self, device: PeerAddress, connected: bool) -> Vec<GattServerEffect> {
        if connected {
            debug!("Raw connection from {}", device);
            return Vec::new();
        }
        if self.peer.as_ref() == Some(&device) {
            info!("Application peer {} disconnected", device);
            self.peer = None;
            return vec![Effect::Notify(GattServerNotice::ClientDisconnected(device))];
        }
        debug!("Unrecognized device {} disconnected", device);
        Vec::new()
    }

    fn on_write(
        &mut self,
        device: PeerAddress,
        request_id: u32,
        characteristic: Uuid,
        response_needed: bool,
        value: Vec<u8>,
    ) -> Vec<GattServerEffect> {
        let mut effects = Vec::new();
        if characteristic == INBOUND_CHARACTERISTIC_UUID && self.state == ServiceState::Running {
            let text = decode_text(&value);
            if text == HANDSHAKE_TOKEN {
                effects.extend(self.on_handshake(device.clone()));
            } else {
                effects.push(Effect::Notify(GattServerNotice::MessageReceived {
                    device: device.clone(),
                    text,
                }));
            }
        } else {
            debug!("Ignoring write to {} from {}", characteristic, device);
        }

        if response_needed {
            effects.push(Effect::Radio(GattServerCommand::SendResponse {
                device,
                request_id,
                status: RadioStatus::SUCCESS,
                value: None,
            }));
        }
        effects
    }

    fn on_handshake(&mut self, device: PeerAddress) -> Vec<GattServerEffect> {
        match &self.peer {
            Some(current) if *current == device => {
                debug!("Repeated handshake from {}", device);
                Vec::new()
            }
            Some(current) => {
                warn!(
                    "Rejecting handshake from {} while serving {}",
                    device, current
                );
                Vec::new()
            }
            None => {
                info!("Handshake accepted from {}", device);
                self.peer = Some(device.clone());
                vec![Effect::Notify(GattServerNotice::ClientConnected(device))]
            }
        }
    }

    /// Tear the session down. Safe to call repeatedly.
    pub fn stop(&mut self) -> Vec<GattServerEffect> {
        if self.destroyed {
            return Vec::new();
        }
        self.destroyed = true;
        self.generation.bump();

        let mut effects = Vec::new();
        if let Some(peer) = self.peer.take() {
            effects.push(Effect::Notify(GattServerNotice::ClientDisconnected(peer)));
        }
        if self.state != ServiceState::Idle {
            effects.push(Effect::Radio(GattServerCommand::ClearServices));
            effects.push(Effect::Radio(GattServerCommand::CloseServer));
        }
        effects.extend(self.enter(StateChange::new(ServiceState::Stopping)));
        effects.extend(self.enter(StateChange::new(ServiceState::Stopped)));
        effects.push(Effect::Notify(GattServerNotice::Destroyed));
        info!("GATT server torn down");
        effects
    }

    fn enter(&mut self, change: StateChange) -> Vec<GattServerEffect> {
        self.state = change.state;
        vec![Effect::Notify(GattServerNotice::StateChanged(change))]
    }
}
