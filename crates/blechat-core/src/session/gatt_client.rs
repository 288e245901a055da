//! GATT client session: the connection resilience state machine
//!
//! ```text
//! connect ──► Starting ──Connected──► MTU ──► discovery ──settle──► handshake ──► Running
//!                │                                                               │
//!                └── timeout / unsolicited disconnect ──► Unhealthy ◄────────────┘
//!                                                          │  backoff, reconnect
//!                                                          └── budget spent ──► StartFailed
//! ```
//!
//! Every connect and every reconnect bumps the generation, so events that
//! belong to a superseded attempt (including the late `Disconnected` that
//! follows a forced disconnect) never reach the transition logic.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::effects::{Effect, TimerKind, TimerToken};
use crate::errors::SessionError;
use crate::protocol::{
    check_message_size, decode_text, DiscoveredService, HANDSHAKE_TOKEN,
    INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use crate::session::StateChange;
use crate::types::{Generation, PeerAddress, RadioStatus, ServiceState};

// ----------------------------------------------------------------------------
// Commands, Events, Notices
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum GattClientCommand {
    Connect { peer: PeerAddress },
    /// Reconnect on the existing handle
    Reconnect,
    Disconnect,
    /// Release the handle
    Close,
    RequestMtu(u16),
    DiscoverServices,
    WriteCharacteristic { characteristic: Uuid, value: Vec<u8> },
    SetNotifications { characteristic: Uuid, enabled: bool },
}

/// Link-layer state reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Connecting,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GattClientEvent {
    ConnectionStateChanged { status: RadioStatus, link: LinkState },
    MtuChanged { mtu: u16, status: RadioStatus },
    ServicesDiscovered {
        status: RadioStatus,
        services: Vec<DiscoveredService>,
    },
    CharacteristicWrite { status: RadioStatus },
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
    /// The remote service table changed under us
    ServiceChanged,
}

/// Result of a chat write, as reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    Failed,
    /// Rejected locally for exceeding the message limit
    TooLong,
}

impl WriteOutcome {
    /// Map a locally rejected send to what the caller sees
    pub fn from_error(error: &SessionError) -> Self {
        match error {
            SessionError::PayloadTooLarge { .. } => WriteOutcome::TooLong,
            _ => WriteOutcome::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Success)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GattClientNotice {
    StateChanged(StateChange),
    MessageReceived(String),
    WriteResult { outcome: WriteOutcome, text: String },
    Destroyed,
}

pub type GattClientEffect = Effect<GattClientCommand, GattClientNotice>;

// ----------------------------------------------------------------------------
// Retry Budget
// ----------------------------------------------------------------------------

/// Consecutive reconnect attempts since the last `Connected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Take one retry if any are left
    pub fn try_consume(&mut self) -> bool {
        if self.attempts < self.max {
            self.attempts += 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

// ----------------------------------------------------------------------------
// GATT Client
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct GattClient {
    state: ServiceState,
    generation: Generation,
    config: SessionConfig,
    peer: Option<PeerAddress>,
    retries: RetryBudget,
    /// Handshake write issued for the current attempt
    handshake_sent: bool,
    /// Handshake acknowledged for the current attempt
    connection_established: bool,
    notifications_enabled: bool,
    /// Text of the chat write awaiting its result
    pending_write: Option<String>,
    destroyed: bool,
}

impl GattClient {
    pub fn new(config: SessionConfig) -> Self {
        let retries = RetryBudget::new(config.max_retries);
        Self {
            state: ServiceState::Idle,
            generation: Generation::INITIAL,
            config,
            peer: None,
            retries,
            handshake_sent: false,
            connection_established: false,
            notifications_enabled: false,
            pending_write: None,
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

    pub fn retry_attempts(&self) -> u32 {
        self.retries.attempts()
    }

    pub fn is_connection_established(&self) -> bool {
        self.connection_established
    }

    pub fn pending_write(&self) -> Option<&str> {
        self.pending_write.as_deref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Begin a fresh connection attempt to `peer`
    pub fn connect(&mut self, peer: PeerAddress) -> Result<Vec<GattClientEffect>, SessionError> {
        if self.destroyed
            || !matches!(self.state, ServiceState::Idle | ServiceState::StartFailed)
        {
            return Err(SessionError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }

        let generation = self.generation.bump();
        self.retries.reset();
        self.reset_attempt();
        self.peer = Some(peer.clone());
        info!("Connecting to {} ({})", peer, generation);

        let mut effects = self.enter(StateChange::new(ServiceState::Starting));
        effects.push(Effect::Radio(GattClientCommand::Connect { peer }));
        effects.push(Effect::start_timer(
            TimerKind::ConnectionTimeout,
            generation,
            self.config.connection_timeout,
        ));
        Ok(effects)
    }

    /// Write a chat message to the peer
    ///
    /// Size is checked first so an oversized text is rejected in every state.
    pub fn send_text(&mut self, text: &str) -> Result<Vec<GattClientEffect>, SessionError> {
        check_message_size(text, self.config.max_message_bytes)?;
        if self.destroyed || self.state != ServiceState::Running {
            return Err(SessionError::NotRunning);
        }
        if self.pending_write.is_some() {
            return Err(SessionError::Busy);
        }
        self.pending_write = Some(text.to_string());
        Ok(vec![Effect::Radio(GattClientCommand::WriteCharacteristic {
            characteristic: INBOUND_CHARACTERISTIC_UUID,
            value: text.as_bytes().to_vec(),
        })])
    }

    pub fn handle_event(
        &mut self,
        generation: Generation,
        event: GattClientEvent,
    ) -> Vec<GattClientEffect> {
        if self.destroyed || generation != self.generation {
            debug!("Dropping stale GATT client event ({})", generation);
            return Vec::new();
        }
        if self.state.is_terminal() || self.state == ServiceState::Idle {
            debug!("Ignoring {:?} while {}", event, self.state);
            return Vec::new();
        }

        match event {
            GattClientEvent::ConnectionStateChanged { status, link } => {
                self.on_connection_state(status, link)
            }
            GattClientEvent::MtuChanged { mtu, status } => {
                if status.is_success() {
                    debug!("MTU negotiated: {}", mtu);
                    vec![Effect::Radio(GattClientCommand::DiscoverServices)]
                } else {
                    warn!("MTU request failed: status {}", status.0);
                    self.fail(SessionError::RadioRejected { status: status.0 })
                }
            }
            GattClientEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services)
            }
            GattClientEvent::CharacteristicWrite { status } => self.on_write(status),
            GattClientEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                if characteristic != OUTBOUND_CHARACTERISTIC_UUID {
                    return Vec::new();
                }
                vec![Effect::Notify(GattClientNotice::MessageReceived(
                    decode_text(&value),
                ))]
            }
            GattClientEvent::ServiceChanged => {
                info!("Remote services changed, tearing down");
                self.disconnect()
            }
        }
    }

    pub fn handle_timer(&mut self, timer: TimerToken) -> Vec<GattClientEffect> {
        if self.destroyed || timer.generation != self.generation || self.state.is_terminal() {
            debug!("Dropping stale {:?} timer ({})", timer.kind, timer.generation);
            return Vec::new();
        }

        match timer.kind {
            TimerKind::ConnectionTimeout => {
                warn!("Connection attempt timed out");
                // Answers to this disconnect belong to the attempt that timed out
                let mut effects = vec![Effect::RadioFor {
                    command: GattClientCommand::Disconnect,
                    generation: self.generation,
                }];
                effects.extend(self.retry(Some(SessionError::Timeout)));
                effects
            }
            TimerKind::RetryBackoff => {
                info!(
                    "Reconnecting (attempt {}/{})",
                    self.retries.attempts(),
                    self.retries.max()
                );
                vec![
                    Effect::Radio(GattClientCommand::Reconnect),
                    Effect::start_timer(
                        TimerKind::ConnectionTimeout,
                        self.generation,
                        self.config.connection_timeout,
                    ),
                ]
            }
            TimerKind::SettleDelay => {
                debug!("Sending handshake");
                self.handshake_sent = true;
                self.notifications_enabled = true;
                vec![
                    Effect::Radio(GattClientCommand::WriteCharacteristic {
                        characteristic: INBOUND_CHARACTERISTIC_UUID,
                        value: HANDSHAKE_TOKEN.as_bytes().to_vec(),
                    }),
                    Effect::Radio(GattClientCommand::SetNotifications {
                        characteristic: OUTBOUND_CHARACTERISTIC_UUID,
                        enabled: true,
                    }),
                ]
            }
            other => {
                debug!("Ignoring {:?} timer", other);
                Vec::new()
            }
        }
    }

    /// Deliberately end the session. Safe to call repeatedly.
    pub fn disconnect(&mut self) -> Vec<GattClientEffect> {
        if self.destroyed {
            return Vec::new();
        }
        self.destroyed = true;
        let previous = self.state;
        self.generation.bump();

        let mut effects = vec![
            Effect::CancelTimer(TimerKind::ConnectionTimeout),
            Effect::CancelTimer(TimerKind::RetryBackoff),
            Effect::CancelTimer(TimerKind::SettleDelay),
        ];
        effects.extend(self.enter(StateChange::new(ServiceState::Stopping)));
        effects.extend(self.fail_pending_write());

        if self.peer.is_some() {
            if self.notifications_enabled {
                effects.push(Effect::Radio(GattClientCommand::SetNotifications {
                    characteristic: OUTBOUND_CHARACTERISTIC_UUID,
                    enabled: false,
                }));
            }
            if matches!(previous, ServiceState::Starting | ServiceState::Unhealthy) {
                effects.push(Effect::Radio(GattClientCommand::Disconnect));
            }
            effects.push(Effect::Radio(GattClientCommand::Close));
        }

        effects.extend(self.enter(StateChange::new(ServiceState::Stopped)));
        effects.push(Effect::Notify(GattClientNotice::Destroyed));
        info!("GATT client torn down (was {})", previous);
        effects
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn on_connection_state(&mut self, status: RadioStatus, link: LinkState) -> Vec<GattClientEffect> {
        match link {
            LinkState::Connected if status.is_success() => {
                info!("Link up");
                self.retries.reset();
                vec![
                    Effect::CancelTimer(TimerKind::ConnectionTimeout),
                    Effect::Radio(GattClientCommand::RequestMtu(self.config.request_mtu)),
                ]
            }
            LinkState::Connected | LinkState::Disconnected => {
                let reason = (!status.is_success()).then_some(SessionError::PeerUnresponsive);
                warn!("Link dropped (status {})", status.0);
                self.retry(reason)
            }
            LinkState::Connecting | LinkState::Disconnecting => {
                warn!("Unexpected link state {:?}", link);
                self.fail(SessionError::RadioRejected { status: status.0 })
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        status: RadioStatus,
        services: &[DiscoveredService],
    ) -> Vec<GattClientEffect> {
        if !status.is_success() {
            warn!("Service discovery failed: status {}", status.0);
            return self.fail(SessionError::RadioRejected { status: status.0 });
        }
        let Some(service) = services.iter().find(|s| s.uuid == SERVICE_UUID) else {
            return self.fail(SessionError::ProtocolMismatch {
                missing: "chat service",
            });
        };
        if !service.characteristics.contains(&INBOUND_CHARACTERISTIC_UUID) {
            return self.fail(SessionError::ProtocolMismatch {
                missing: "inbound characteristic",
            });
        }
        if !service.characteristics.contains(&OUTBOUND_CHARACTERISTIC_UUID) {
            return self.fail(SessionError::ProtocolMismatch {
                missing: "outbound characteristic",
            });
        }
        vec![Effect::start_timer(
            TimerKind::SettleDelay,
            self.generation,
            self.config.settle_delay,
        )]
    }

    fn on_write(&mut self, status: RadioStatus) -> Vec<GattClientEffect> {
        if !self.connection_established {
            if !self.handshake_sent {
                debug!("Write result before handshake");
                return Vec::new();
            }
            if !status.is_success() {
                warn!("Handshake write failed: status {}", status.0);
                return self.fail(SessionError::RadioRejected { status: status.0 });
            }
            self.connection_established = true;
            info!("Handshake acknowledged, session running");
            return self.enter(StateChange::new(ServiceState::Running));
        }

        match self.pending_write.take() {
            Some(text) => {
                let outcome = if status.is_success() {
                    WriteOutcome::Success
                } else {
                    WriteOutcome::Failed
                };
                vec![Effect::Notify(GattClientNotice::WriteResult { outcome, text })]
            }
            None => {
                debug!("Write result with nothing in flight");
                Vec::new()
            }
        }
    }

    /// Reconnect after a drop, or give up once the budget is spent
    fn retry(&mut self, reason: Option<SessionError>) -> Vec<GattClientEffect> {
        let mut effects = vec![
            Effect::CancelTimer(TimerKind::ConnectionTimeout),
            Effect::CancelTimer(TimerKind::SettleDelay),
        ];
        effects.extend(self.fail_pending_write());

        if !self.retries.try_consume() {
            warn!("Retry budget of {} spent", self.retries.max());
            let reason = reason.unwrap_or(SessionError::PeerUnresponsive);
            effects.extend(self.enter(StateChange::because(ServiceState::StartFailed, reason)));
            return effects;
        }

        let generation = self.generation.bump();
        self.reset_attempt();
        let change = match reason {
            Some(reason) => StateChange::because(ServiceState::Unhealthy, reason),
            None => StateChange::new(ServiceState::Unhealthy),
        };
        effects.extend(self.enter(change));
        effects.push(Effect::start_timer(
            TimerKind::RetryBackoff,
            generation,
            self.config.retry_backoff,
        ));
        effects
    }

    fn fail(&mut self, reason: SessionError) -> Vec<GattClientEffect> {
        let mut effects = vec![
            Effect::CancelTimer(TimerKind::ConnectionTimeout),
            Effect::CancelTimer(TimerKind::SettleDelay),
        ];
        effects.extend(self.fail_pending_write());
        effects.extend(self.enter(StateChange::because(ServiceState::StartFailed, reason)));
        effects
    }

    fn fail_pending_write(&mut self) -> Vec<GattClientEffect> {
        match self.pending_write.take() {
            Some(text) => vec![Effect::Notify(GattClientNotice::WriteResult {
                outcome: WriteOutcome::Failed,
                text,
            })],
            None => Vec::new(),
        }
    }

    fn reset_attempt(&mut self) {
        self.handshake_sent = false;
        self.connection_established = false;
        self.notifications_enabled = false;
    }

    fn enter(&mut self, change: StateChange) -> Vec<GattClientEffect> {
        self.state = change.state;
        vec![Effect::Notify(GattClientNotice::StateChanged(change))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddress {
        PeerAddress::new("AA:BB:CC:DD:EE:FF")
    }

    fn chat_services() -> Vec<DiscoveredService> {
        vec![DiscoveredService {
            uuid: SERVICE_UUID,
            characteristics: vec![INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID],
        }]
    }

    fn link(link: LinkState) -> GattClientEvent {
        GattClientEvent::ConnectionStateChanged {
            status: RadioStatus::SUCCESS,
            link,
        }
    }

    fn states(effects: &[GattClientEffect]) -> Vec<ServiceState> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Notify(GattClientNotice::StateChanged(change)) => Some(change.state),
                _ => None,
            })
            .collect()
    }

    fn commands(effects: &[GattClientEffect]) -> Vec<GattClientCommand> {
        effects.iter().filter_map(|e| e.radio().cloned()).collect()
    }

    /// Drive an attempt from `Connected` through the handshake
    fn establish(client: &mut GattClient) -> Vec<GattClientEffect> {
        let generation = client.generation();
        let mut effects = client.handle_event(generation, link(LinkState::Connected));
        effects.extend(client.handle_event(
            generation,
            GattClientEvent::MtuChanged {
                mtu: 512,
                status: RadioStatus::SUCCESS,
            },
        ));
        effects.extend(client.handle_event(
            generation,
            GattClientEvent::ServicesDiscovered {
                status: RadioStatus::SUCCESS,
                services: chat_services(),
            },
        ));
        effects.extend(
            client.handle_timer(TimerToken::new(TimerKind::SettleDelay, generation)),
        );
        effects.extend(client.handle_event(
            generation,
            GattClientEvent::CharacteristicWrite {
                status: RadioStatus::SUCCESS,
            },
        ));
        effects
    }

    fn running_client() -> GattClient {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(peer()).unwrap();
        establish(&mut client);
        assert_eq!(client.state(), ServiceState::Running);
        client
    }

    #[test]
    fn test_clean_connect_reports_starting_then_running() {
        let mut client = GattClient::new(SessionConfig::default());
        let mut effects = client.connect(peer()).unwrap();
        effects.extend(establish(&mut client));

        assert_eq!(
            states(&effects),
            vec![ServiceState::Starting, ServiceState::Running]
        );
        assert_eq!(
            commands(&effects),
            vec![
                GattClientCommand::Connect { peer: peer() },
                GattClientCommand::RequestMtu(512),
                GattClientCommand::DiscoverServices,
                GattClientCommand::WriteCharacteristic {
                    characteristic: INBOUND_CHARACTERISTIC_UUID,
                    value: HANDSHAKE_TOKEN.as_bytes().to_vec(),
                },
                GattClientCommand::SetNotifications {
                    characteristic: OUTBOUND_CHARACTERISTIC_UUID,
                    enabled: true,
                },
            ]
        );
        assert!(client.is_connection_established());
    }

    #[test]
    fn test_connect_arms_timeout_for_its_generation() {
        let mut client = GattClient::new(SessionConfig::default());
        let effects = client.connect(peer()).unwrap();
        assert!(effects.contains(&Effect::StartTimer {
            timer: TimerToken::new(TimerKind::ConnectionTimeout, client.generation()),
            after: SessionConfig::default().connection_timeout,
        }));
    }

    #[test]
    fn test_timeout_forces_disconnect_and_retries() {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(peer()).unwrap();
        let first = client.generation();

        let effects = client.handle_timer(TimerToken::new(TimerKind::ConnectionTimeout, first));
        assert_eq!(
            effects[0],
            Effect::RadioFor {
                command: GattClientCommand::Disconnect,
                generation: first,
            }
        );
        assert_eq!(states(&effects), vec![ServiceState::Unhealthy]);
        assert_eq!(client.retry_attempts(), 1);
        assert!(client.generation() > first);

        // The disconnect we forced arrives late and must not count again
        let late = client.handle_event(first, link(LinkState::Disconnected));
        assert!(late.is_empty());
        assert_eq!(client.retry_attempts(), 1);
    }

    #[test]
    fn test_backoff_reissues_reconnect_and_timeout() {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(peer()).unwrap();
        client.handle_event(client.generation(), link(LinkState::Disconnected));

        let generation = client.generation();
        let effects = client.handle_timer(TimerToken::new(TimerKind::RetryBackoff, generation));
        assert_eq!(
            effects,
            vec![
                Effect::Radio(GattClientCommand::Reconnect),
                Effect::start_timer(
                    TimerKind::ConnectionTimeout,
                    generation,
                    SessionConfig::default().connection_timeout
                ),
            ]
        );
    }

    #[test]
    fn test_transient_drop_recovers_and_resets_budget() {
        let mut client = running_client();

        let effects = client.handle_event(client.generation(), link(LinkState::Disconnected));
        assert_eq!(states(&effects), vec![ServiceState::Unhealthy]);
        assert_eq!(client.retry_attempts(), 1);
        assert!(!client.is_connection_established());

        client.handle_timer(TimerToken::new(TimerKind::RetryBackoff, client.generation()));
        let effects = establish(&mut client);
        assert_eq!(states(&effects), vec![ServiceState::Running]);
        assert_eq!(client.retry_attempts(), 0);
    }

    #[test]
    fn test_budget_exhaustion_issues_exactly_max_reconnects() {
        let mut client = GattClient::new(SessionConfig::default());
        let mut all = client.connect(peer()).unwrap();

        for _ in 0..6 {
            let generation = client.generation();
            all.extend(client.handle_event(
                generation,
                GattClientEvent::ConnectionStateChanged {
                    status: RadioStatus(8),
                    link: LinkState::Disconnected,
                },
            ));
            all.extend(
                client.handle_timer(TimerToken::new(TimerKind::RetryBackoff, client.generation())),
            );
        }

        let reconnects = commands(&all)
            .into_iter()
            .filter(|c| *c == GattClientCommand::Reconnect)
            .count();
        assert_eq!(reconnects, 5);
        assert_eq!(client.state(), ServiceState::StartFailed);
        assert_eq!(
            all.iter().rev().find_map(|e| match e {
                Effect::Notify(GattClientNotice::StateChanged(change)) => Some(change.clone()),
                _ => None,
            }),
            Some(StateChange::because(
                ServiceState::StartFailed,
                SessionError::PeerUnresponsive
            ))
        );

        // Sticky until a fresh connect
        assert!(client
            .handle_event(client.generation(), link(LinkState::Connected))
            .is_empty());
        assert!(client.connect(peer()).is_ok());
        assert_eq!(client.retry_attempts(), 0);
    }

    #[test]
    fn test_mtu_failure_is_start_failed() {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(peer()).unwrap();
        let generation = client.generation();
        client.handle_event(generation, link(LinkState::Connected));
        let effects = client.handle_event(
            generation,
            GattClientEvent::MtuChanged {
                mtu: 23,
                status: RadioStatus(4),
            },
        );
        assert_eq!(states(&effects), vec![ServiceState::StartFailed]);
    }

    #[test]
    fn test_missing_characteristic_is_protocol_mismatch() {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(peer()).unwrap();
        let generation = client.generation();
        client.handle_event(generation, link(LinkState::Connected));
        let effects = client.handle_event(
            generation,
            GattClientEvent::ServicesDiscovered {
                status: RadioStatus::SUCCESS,
                services: vec![DiscoveredService {
                    uuid: SERVICE_UUID,
                    characteristics: vec![INBOUND_CHARACTERISTIC_UUID],
                }],
            },
        );
        assert!(effects.contains(&Effect::Notify(GattClientNotice::StateChanged(
            StateChange::because(
                ServiceState::StartFailed,
                SessionError::ProtocolMismatch {
                    missing: "outbound characteristic"
                }
            )
        ))));
    }

    #[test]
    fn test_oversized_message_never_reaches_radio() {
        let mut client = running_client();
        let err = client.send_text(&"X".repeat(301)).unwrap_err();
        assert_eq!(WriteOutcome::from_error(&err), WriteOutcome::TooLong);
        assert!(client.pending_write().is_none());

        let mut idle = GattClient::new(SessionConfig::default());
        assert!(matches!(
            idle.send_text(&"X".repeat(301)),
            Err(SessionError::PayloadTooLarge { .. })
        ));
        assert_eq!(idle.send_text("hi"), Err(SessionError::NotRunning));
    }

    #[test]
    fn test_write_result_correlates_to_recorded_text() {
        let mut client = running_client();
        let effects = client.send_text("hello").unwrap();
        assert_eq!(
            commands(&effects),
            vec![GattClientCommand::WriteCharacteristic {
                characteristic: INBOUND_CHARACTERISTIC_UUID,
                value: b"hello".to_vec(),
            }]
        );
        assert_eq!(client.send_text("second"), Err(SessionError::Busy));

        let effects = client.handle_event(
            client.generation(),
            GattClientEvent::CharacteristicWrite {
                status: RadioStatus::SUCCESS,
            },
        );
        assert_eq!(
            effects,
            vec![Effect::Notify(GattClientNotice::WriteResult {
                outcome: WriteOutcome::Success,
                text: "hello".to_string()
            })]
        );
        assert!(client.send_text("second").is_ok());
    }

    #[test]
    fn test_notifications_surface_without_handshake_filtering() {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(peer()).unwrap();
        let effects = client.handle_event(
            client.generation(),
            GattClientEvent::CharacteristicChanged {
                characteristic: OUTBOUND_CHARACTERISTIC_UUID,
                value: HANDSHAKE_TOKEN.as_bytes().to_vec(),
            },
        );
        assert_eq!(
            effects,
            vec![Effect::Notify(GattClientNotice::MessageReceived(
                HANDSHAKE_TOKEN.to_string()
            ))]
        );
    }

    #[test]
    fn test_disconnect_while_starting_cancels_attempt() {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(peer()).unwrap();
        let effects = client.disconnect();
        assert_eq!(
            commands(&effects),
            vec![GattClientCommand::Disconnect, GattClientCommand::Close]
        );
        assert_eq!(
            states(&effects),
            vec![ServiceState::Stopping, ServiceState::Stopped]
        );
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut client = running_client();
        let old_generation = client.generation();
        let effects = client.disconnect();
        assert_eq!(
            commands(&effects),
            vec![
                GattClientCommand::SetNotifications {
                    characteristic: OUTBOUND_CHARACTERISTIC_UUID,
                    enabled: false,
                },
                GattClientCommand::Close,
            ]
        );
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Notify(GattClientNotice::Destroyed)))
                .count(),
            1
        );
        assert!(client.disconnect().is_empty());
        assert!(client
            .handle_timer(TimerToken::new(TimerKind::ConnectionTimeout, old_generation))
            .is_empty());
        assert_eq!(client.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_service_changed_tears_down() {
        let mut client = running_client();
        let effects = client.handle_event(client.generation(), GattClientEvent::ServiceChanged);
        assert_eq!(
            states(&effects),
            vec![ServiceState::Stopping, ServiceState::Stopped]
        );
        assert!(client.is_destroyed());
    }

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.attempts(), 2);
        budget.reset();
        assert_eq!(budget.attempts(), 0);
    }
}
