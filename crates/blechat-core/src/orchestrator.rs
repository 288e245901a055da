//! Session orchestrator
//!
//! Owns the four binding states, the role register and the auto-rebind rule.
//! Like the sessions it is sans-IO: it answers with [`Directive`]s for the
//! runtime, rebind timers, and [`OrchestratorNotice`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::effects::{Effect, TimerKind, TimerToken};
use crate::errors::{OrchestratorError, StateTransitionError};
use crate::types::{
    ConnectionBindingState, ConnectionRole, Generation, PeerAddress, ServiceKind, ServiceState,
};

// ----------------------------------------------------------------------------
// Environment and Capabilities
// ----------------------------------------------------------------------------

/// Preconditions owned by the host platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub radio_enabled: bool,
    pub location_enabled: bool,
    pub permissions_granted: bool,
}

impl Environment {
    pub fn ready() -> Self {
        Self {
            radio_enabled: true,
            location_enabled: true,
            permissions_granted: true,
        }
    }

    pub fn all_met(&self) -> bool {
        self.radio_enabled && self.location_enabled && self.permissions_granted
    }
}

/// Hardware features the adapter reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub extended_advertising: bool,
    pub le_2m_phy: bool,
    pub multiple_advertisement: bool,
    pub offloaded_filtering: bool,
    pub offloaded_scan_batching: bool,
    /// Longest advertising payload the controller accepts
    pub max_advertising_data_len: usize,
}

impl Capabilities {
    pub fn full(max_advertising_data_len: usize) -> Self {
        Self {
            extended_advertising: true,
            le_2m_phy: true,
            multiple_advertisement: true,
            offloaded_filtering: true,
            offloaded_scan_batching: true,
            max_advertising_data_len,
        }
    }

    /// The first required feature that is absent
    pub fn missing(&self) -> Option<&'static str> {
        [
            (self.extended_advertising, "extended advertising"),
            (self.le_2m_phy, "LE 2M PHY"),
            (self.multiple_advertisement, "multiple advertisement"),
            (self.offloaded_filtering, "offloaded filtering"),
            (self.offloaded_scan_batching, "offloaded scan batching"),
        ]
        .into_iter()
        .find_map(|(present, name)| (!present).then_some(name))
    }
}

// ----------------------------------------------------------------------------
// Role Register
// ----------------------------------------------------------------------------

/// Single authority for which GATT role is active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleRegister {
    held: ConnectionRole,
}

impl RoleRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ConnectionRole {
        self.held
    }

    /// Take `role` unless a different role is already held
    pub fn try_acquire(&mut self, role: ConnectionRole) -> Result<(), OrchestratorError> {
        match self.held {
            ConnectionRole::None => {
                self.held = role;
                Ok(())
            }
            held if held == role => Ok(()),
            held => Err(OrchestratorError::RoleHeld { held }),
        }
    }

    /// Give up `role`. Returns whether it was held.
    pub fn release(&mut self, role: ConnectionRole) -> bool {
        if role != ConnectionRole::None && self.held == role {
            self.held = ConnectionRole::None;
            true
        } else {
            false
        }
    }
}

// ----------------------------------------------------------------------------
// Inputs and Outputs
// ----------------------------------------------------------------------------

/// Work the runtime must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Spawn and start a session; the client also gets the peer to dial
    Bind {
        kind: ServiceKind,
        peer: Option<PeerAddress>,
    },
    Unbind(ServiceKind),
    StopScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorNotice {
    BindingChanged {
        kind: ServiceKind,
        state: ConnectionBindingState,
    },
    RoleChanged(ConnectionRole),
    /// A handshake arrived while this device was acting as client
    ServerPeerRejected(PeerAddress),
}

/// What the runtime reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    EnvironmentChanged(Environment),
    /// The session for this kind is up
    Bound(ServiceKind),
    /// The session could not be created
    BindFailed(ServiceKind),
    /// The session emitted its destroyed signal
    Destroyed(ServiceKind),
    /// The session went away without a destroyed signal
    SessionLost(ServiceKind),
    AdvertiserState(ServiceState),
    ServerState(ServiceState),
    ClientState(ServiceState),
    ScanStatus(bool),
    ServerPeerPromoted(PeerAddress),
    ServerPeerLost(PeerAddress),
}

/// Where an outgoing chat message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRoute {
    Client,
    Server(PeerAddress),
}

pub type OrchestratorEffect = Effect<Directive, OrchestratorNotice>;

// ----------------------------------------------------------------------------
// Orchestrator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct Binding {
    state: ConnectionBindingState,
    generation: Generation,
}

#[derive(Debug)]
pub struct Orchestrator {
    bindings: [Binding; 4],
    roles: RoleRegister,
    environment: Environment,
    capabilities: Option<Capabilities>,
    client_state: ServiceState,
    server_peer: Option<PeerAddress>,
    scanning: bool,
    rebind_delay: Duration,
}

impl Orchestrator {
    pub fn new(rebind_delay: Duration) -> Self {
        Self {
            bindings: [Binding::default(); 4],
            roles: RoleRegister::new(),
            environment: Environment::default(),
            capabilities: None,
            client_state: ServiceState::Idle,
            server_peer: None,
            scanning: false,
            rebind_delay,
        }
    }

    pub fn binding(&self, kind: ServiceKind) -> ConnectionBindingState {
        self.bindings[kind.index()].state
    }

    pub fn role(&self) -> ConnectionRole {
        self.roles.current()
    }

    pub fn client_state(&self) -> ServiceState {
        self.client_state
    }

    pub fn server_peer(&self) -> Option<&PeerAddress> {
        self.server_peer.as_ref()
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Check hardware support and bind the always-on services if possible
    pub fn start(
        &mut self,
        capabilities: Capabilities,
        environment: Environment,
    ) -> Result<Vec<OrchestratorEffect>, OrchestratorError> {
        if let Some(capability) = capabilities.missing() {
            warn!("Refusing to start: {} unsupported", capability);
            return Err(OrchestratorError::Unsupported { capability });
        }
        self.capabilities = Some(capabilities);
        self.environment = environment;

        if !environment.all_met() {
            info!("Waiting for radio, location and permissions");
            return Ok(Vec::new());
        }
        Ok(self.bind_always_on())
    }

    /// Bind the client to `peer` in response to a user selection
    pub fn select_peer(
        &mut self,
        peer: PeerAddress,
    ) -> Result<Vec<OrchestratorEffect>, OrchestratorError> {
        if !self.environment.all_met() {
            return Err(OrchestratorError::EnvironmentNotReady);
        }
        if self.roles.current() == ConnectionRole::Server {
            return Err(OrchestratorError::AlreadyServing);
        }
        match self.client_state {
            ServiceState::Running => return Err(OrchestratorError::AlreadyConnected),
            ServiceState::Starting => return Err(OrchestratorError::AlreadyConnecting),
            state @ (ServiceState::Unhealthy | ServiceState::StartFailed) => {
                return Err(OrchestratorError::ClientBusy { state })
            }
            _ => {}
        }

        let binding = self.binding(ServiceKind::GattClient);
        if !binding.can_bind() {
            return Err(OrchestratorError::BindingBusy { binding });
        }

        // The role is reserved for the whole attempt, retries included
        let mut effects = self.acquire_role(ConnectionRole::Client)?;
        if self.scanning {
            effects.push(Effect::Radio(Directive::StopScan));
        }
        effects.extend(self.bind(ServiceKind::GattClient, Some(peer)));
        Ok(effects)
    }

    /// Decide which session carries an outgoing message
    pub fn route_send(&self) -> Result<SendRoute, OrchestratorError> {
        match self.roles.current() {
            ConnectionRole::Client => Ok(SendRoute::Client),
            ConnectionRole::Server => self
                .server_peer
                .clone()
                .map(SendRoute::Server)
                .ok_or(OrchestratorError::NoActivePeer),
            ConnectionRole::None => Err(OrchestratorError::NoActivePeer),
        }
    }

    pub fn handle_event(&mut self, event: OrchestratorEvent) -> Vec<OrchestratorEffect> {
        match event {
            OrchestratorEvent::EnvironmentChanged(environment) => {
                self.on_environment(environment)
            }
            OrchestratorEvent::Bound(kind) => {
                self.transition(kind, ConnectionBindingState::Connected)
            }
            OrchestratorEvent::BindFailed(kind) => {
                warn!("Binding {} failed", kind);
                let mut effects = self.set_binding(kind, ConnectionBindingState::NotConnected);
                if kind == ServiceKind::GattClient {
                    effects.extend(self.release_role(ConnectionRole::Client));
                }
                effects
            }
            OrchestratorEvent::Destroyed(kind) => self.on_destroyed(kind, None),
            OrchestratorEvent::SessionLost(kind) => {
                warn!("{} session lost without teardown", kind);
                self.on_destroyed(kind, Some(ConnectionBindingState::Unhealthy))
            }
            OrchestratorEvent::AdvertiserState(state) => {
                self.unbind_if_finished(ServiceKind::Advertiser, state)
            }
            OrchestratorEvent::ServerState(state) => {
                self.unbind_if_finished(ServiceKind::GattServer, state)
            }
            OrchestratorEvent::ClientState(state) => self.on_client_state(state),
            OrchestratorEvent::ScanStatus(scanning) => {
                self.scanning = scanning;
                Vec::new()
            }
            OrchestratorEvent::ServerPeerPromoted(device) => self.on_server_peer(device),
            OrchestratorEvent::ServerPeerLost(device) => {
                if self.server_peer.as_ref() != Some(&device) {
                    return Vec::new();
                }
                self.server_peer = None;
                self.release_role(ConnectionRole::Server)
            }
        }
    }

    /// The settle delay after a teardown has passed
    pub fn handle_timer(&mut self, timer: TimerToken) -> Vec<OrchestratorEffect> {
        let TimerKind::Rebind(kind) = timer.kind else {
            return Vec::new();
        };
        if self.bindings[kind.index()].generation != timer.generation {
            debug!("Dropping stale rebind timer for {}", kind);
            return Vec::new();
        }

        let mut effects = self.set_binding(kind, ConnectionBindingState::NotConnected);
        if kind == ServiceKind::GattClient {
            self.client_state = ServiceState::Idle;
            effects.extend(self.release_role(ConnectionRole::Client));
        }
        effects.extend(self.auto_rebind(kind));
        effects
    }

    /// Unbind everything, used on shutdown
    pub fn unbind_all(&mut self) -> Vec<OrchestratorEffect> {
        ServiceKind::ALL
            .into_iter()
            .flat_map(|kind| self.unbind(kind))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------------

    fn on_environment(&mut self, environment: Environment) -> Vec<OrchestratorEffect> {
        let was_ready = self.environment.all_met();
        self.environment = environment;
        match (was_ready, environment.all_met()) {
            (false, true) if self.capabilities.is_some() => {
                info!("Environment ready, binding services");
                self.bind_always_on()
            }
            (true, false) => {
                info!("Environment lost, unbinding services");
                self.unbind_all()
            }
            _ => Vec::new(),
        }
    }

    fn on_destroyed(
        &mut self,
        kind: ServiceKind,
        state: Option<ConnectionBindingState>,
    ) -> Vec<OrchestratorEffect> {
        let binding = &mut self.bindings[kind.index()];
        let generation = binding.generation.bump();
        let state = state.unwrap_or(ConnectionBindingState::Disconnecting);

        let mut effects = Vec::new();
        if binding.state != state {
            binding.state = state;
            effects.push(Effect::Notify(OrchestratorNotice::BindingChanged { kind, state }));
        }
        if kind == ServiceKind::Scanner {
            self.scanning = false;
        }
        effects.push(Effect::start_timer(
            TimerKind::Rebind(kind),
            generation,
            self.rebind_delay,
        ));
        effects
    }

    fn on_client_state(&mut self, state: ServiceState) -> Vec<OrchestratorEffect> {
        self.client_state = state;
        let mut effects = Vec::new();
        match state {
            ServiceState::Running => match self.acquire_role(ConnectionRole::Client) {
                Ok(acquired) => effects.extend(acquired),
                Err(err) => {
                    warn!("Client running without the role, unbinding: {}", err);
                    effects.extend(self.unbind(ServiceKind::GattClient));
                    return effects;
                }
            },
            // Still the same attempt
            ServiceState::Starting | ServiceState::Unhealthy => {}
            ServiceState::Idle
            | ServiceState::StartFailed
            | ServiceState::Stopping
            | ServiceState::Stopped => {
                effects.extend(self.release_role(ConnectionRole::Client));
            }
        }
        effects.extend(self.unbind_if_finished(ServiceKind::GattClient, state));
        effects
    }

    fn on_server_peer(&mut self, device: PeerAddress) -> Vec<OrchestratorEffect> {
        match self.acquire_role(ConnectionRole::Server) {
            Ok(effects) => {
                info!("Serving {}", device);
                self.server_peer = Some(device);
                effects
            }
            Err(err) => {
                warn!("Refusing server peer {}: {}", device, err);
                vec![Effect::Notify(OrchestratorNotice::ServerPeerRejected(device))]
            }
        }
    }

    /// Take `role`, noticing only a change of holder
    fn acquire_role(
        &mut self,
        role: ConnectionRole,
    ) -> Result<Vec<OrchestratorEffect>, OrchestratorError> {
        let held = self.roles.current();
        self.roles.try_acquire(role)?;
        if held == role {
            Ok(Vec::new())
        } else {
            Ok(vec![Effect::Notify(OrchestratorNotice::RoleChanged(role))])
        }
    }

    fn release_role(&mut self, role: ConnectionRole) -> Vec<OrchestratorEffect> {
        if self.roles.release(role) {
            vec![Effect::Notify(OrchestratorNotice::RoleChanged(
                ConnectionRole::None,
            ))]
        } else {
            Vec::new()
        }
    }

    fn unbind_if_finished(&mut self, kind: ServiceKind, state: ServiceState) -> Vec<OrchestratorEffect> {
        match state {
            ServiceState::StartFailed | ServiceState::Stopped => self.unbind(kind),
            _ => Vec::new(),
        }
    }

    fn auto_rebind(&mut self, kind: ServiceKind) -> Vec<OrchestratorEffect> {
        if !ServiceKind::ALWAYS_ON.contains(&kind) || !self.environment.all_met() {
            return Vec::new();
        }
        if kind == ServiceKind::Advertiser
            && self.binding(ServiceKind::GattClient) == ConnectionBindingState::Connecting
        {
            debug!("Holding advertiser rebind while the client connects");
            return Vec::new();
        }
        self.bind(kind, None)
    }

    fn bind_always_on(&mut self) -> Vec<OrchestratorEffect> {
        ServiceKind::ALWAYS_ON
            .into_iter()
            .flat_map(|kind| self.bind(kind, None))
            .collect()
    }

    fn bind(&mut self, kind: ServiceKind, peer: Option<PeerAddress>) -> Vec<OrchestratorEffect> {
        let state = self.binding(kind);
        if !state.can_bind() {
            debug!("Ignoring bind of {} while {}", kind, state);
            return Vec::new();
        }
        let mut effects = self.set_binding(kind, ConnectionBindingState::Connecting);
        effects.push(Effect::Radio(Directive::Bind { kind, peer }));
        effects
    }

    fn unbind(&mut self, kind: ServiceKind) -> Vec<OrchestratorEffect> {
        let state = self.binding(kind);
        if state.can_bind() || state == ConnectionBindingState::Disconnecting {
            debug!("Ignoring unbind of {} while {}", kind, state);
            return Vec::new();
        }
        let mut effects = self.set_binding(kind, ConnectionBindingState::Disconnecting);
        effects.push(Effect::Radio(Directive::Unbind(kind)));
        effects
    }

    /// Checked transition for completions reported by the runtime
    fn transition(
        &mut self,
        kind: ServiceKind,
        to: ConnectionBindingState,
    ) -> Vec<OrchestratorEffect> {
        let from = self.binding(kind);
        if from != ConnectionBindingState::Connecting {
            let err = StateTransitionError {
                service: kind,
                from,
                to,
            };
            warn!("{}", err);
            return Vec::new();
        }
        self.set_binding(kind, to)
    }

    fn set_binding(
        &mut self,
        kind: ServiceKind,
        state: ConnectionBindingState,
    ) -> Vec<OrchestratorEffect> {
        let binding = &mut self.bindings[kind.index()];
        if binding.state == state {
            return Vec::new();
        }
        debug!("{} binding: {} -> {}", kind, binding.state, state);
        binding.state = state;
        vec![Effect::Notify(OrchestratorNotice::BindingChanged { kind, state })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(2);

    fn directives(effects: &[OrchestratorEffect]) -> Vec<Directive> {
        effects.iter().filter_map(|e| e.radio().cloned()).collect()
    }

    fn started() -> Orchestrator {
        let mut orchestrator = Orchestrator::new(DELAY);
        orchestrator
            .start(Capabilities::full(251), Environment::ready())
            .unwrap();
        for kind in ServiceKind::ALWAYS_ON {
            orchestrator.handle_event(OrchestratorEvent::Bound(kind));
        }
        orchestrator
    }

    fn rebind_timer(effects: &[OrchestratorEffect]) -> Option<TimerToken> {
        effects.iter().find_map(|e| match e {
            Effect::StartTimer { timer, .. } => Some(*timer),
            _ => None,
        })
    }

    #[test]
    fn test_start_binds_always_on_services() {
        let mut orchestrator = Orchestrator::new(DELAY);
        let effects = orchestrator
            .start(Capabilities::full(251), Environment::ready())
            .unwrap();
        assert_eq!(
            directives(&effects),
            vec![
                Directive::Bind { kind: ServiceKind::Advertiser, peer: None },
                Directive::Bind { kind: ServiceKind::Scanner, peer: None },
                Directive::Bind { kind: ServiceKind::GattServer, peer: None },
            ]
        );
        assert_eq!(
            orchestrator.binding(ServiceKind::GattClient),
            ConnectionBindingState::Waiting
        );
    }

    #[test]
    fn test_missing_capability_refuses_start() {
        let mut orchestrator = Orchestrator::new(DELAY);
        let capabilities = Capabilities {
            le_2m_phy: false,
            ..Capabilities::full(251)
        };
        assert_eq!(
            orchestrator.start(capabilities, Environment::ready()),
            Err(OrchestratorError::Unsupported {
                capability: "LE 2M PHY"
            })
        );
    }

    #[test]
    fn test_environment_gates_binding() {
        let mut orchestrator = Orchestrator::new(DELAY);
        let effects = orchestrator
            .start(Capabilities::full(251), Environment::default())
            .unwrap();
        assert!(effects.is_empty());

        let effects =
            orchestrator.handle_event(OrchestratorEvent::EnvironmentChanged(Environment::ready()));
        assert_eq!(directives(&effects).len(), 3);

        for kind in ServiceKind::ALWAYS_ON {
            orchestrator.handle_event(OrchestratorEvent::Bound(kind));
        }
        let effects = orchestrator.handle_event(OrchestratorEvent::EnvironmentChanged(
            Environment {
                location_enabled: false,
                ..Environment::ready()
            },
        ));
        assert_eq!(
            directives(&effects),
            vec![
                Directive::Unbind(ServiceKind::Advertiser),
                Directive::Unbind(ServiceKind::Scanner),
                Directive::Unbind(ServiceKind::GattServer),
            ]
        );
    }

    #[test]
    fn test_redundant_bind_is_ignored() {
        let mut orchestrator = started();
        let effects = orchestrator.bind(ServiceKind::Scanner, None);
        assert!(effects.is_empty());
        assert!(orchestrator.unbind(ServiceKind::GattClient).is_empty());
    }

    #[test]
    fn test_destroyed_rebinds_always_on_after_delay() {
        let mut orchestrator = started();
        let effects = orchestrator.handle_event(OrchestratorEvent::Destroyed(ServiceKind::Scanner));
        assert!(directives(&effects).is_empty());
        let timer = rebind_timer(&effects).unwrap();
        assert_eq!(timer.kind, TimerKind::Rebind(ServiceKind::Scanner));

        let effects = orchestrator.handle_timer(timer);
        assert_eq!(
            directives(&effects),
            vec![Directive::Bind { kind: ServiceKind::Scanner, peer: None }]
        );
        assert_eq!(
            orchestrator.binding(ServiceKind::Scanner),
            ConnectionBindingState::Connecting
        );
    }

    #[test]
    fn test_client_is_never_rebound_automatically() {
        let mut orchestrator = started();
        orchestrator.select_peer(PeerAddress::new("PEER")).unwrap();
        orchestrator.handle_event(OrchestratorEvent::Bound(ServiceKind::GattClient));
        orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Running));
        assert_eq!(orchestrator.role(), ConnectionRole::Client);

        let effects = orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Stopped));
        assert_eq!(
            directives(&effects),
            vec![Directive::Unbind(ServiceKind::GattClient)]
        );
        assert_eq!(orchestrator.role(), ConnectionRole::None);

        let effects =
            orchestrator.handle_event(OrchestratorEvent::Destroyed(ServiceKind::GattClient));
        let effects = orchestrator.handle_timer(rebind_timer(&effects).unwrap());
        assert!(directives(&effects).is_empty());
        assert_eq!(
            orchestrator.binding(ServiceKind::GattClient),
            ConnectionBindingState::NotConnected
        );
        assert_eq!(orchestrator.client_state(), ServiceState::Idle);
    }

    #[test]
    fn test_select_peer_stops_scan_and_binds_client() {
        let mut orchestrator = started();
        orchestrator.handle_event(OrchestratorEvent::ScanStatus(true));
        let effects = orchestrator.select_peer(PeerAddress::new("PEER")).unwrap();
        assert_eq!(
            directives(&effects),
            vec![
                Directive::StopScan,
                Directive::Bind {
                    kind: ServiceKind::GattClient,
                    peer: Some(PeerAddress::new("PEER"))
                },
            ]
        );
    }

    #[test]
    fn test_select_peer_rejections() {
        let mut orchestrator = started();
        orchestrator.handle_event(OrchestratorEvent::ServerPeerPromoted(PeerAddress::new("A")));
        assert_eq!(
            orchestrator.select_peer(PeerAddress::new("B")),
            Err(OrchestratorError::AlreadyServing)
        );

        let mut orchestrator = started();
        orchestrator.select_peer(PeerAddress::new("B")).unwrap();
        orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Starting));
        assert_eq!(
            orchestrator.select_peer(PeerAddress::new("B")),
            Err(OrchestratorError::AlreadyConnecting)
        );
        orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Unhealthy));
        assert_eq!(
            orchestrator.select_peer(PeerAddress::new("B")),
            Err(OrchestratorError::ClientBusy {
                state: ServiceState::Unhealthy
            })
        );
    }

    #[test]
    fn test_advertiser_rebind_waits_for_client_connect() {
        let mut orchestrator = started();
        orchestrator.select_peer(PeerAddress::new("PEER")).unwrap();
        let effects =
            orchestrator.handle_event(OrchestratorEvent::Destroyed(ServiceKind::Advertiser));
        let effects = orchestrator.handle_timer(rebind_timer(&effects).unwrap());
        assert!(directives(&effects).is_empty());
        assert_eq!(
            orchestrator.binding(ServiceKind::Advertiser),
            ConnectionBindingState::NotConnected
        );
    }

    #[test]
    fn test_server_promotion_refused_while_client() {
        let mut orchestrator = started();
        orchestrator.select_peer(PeerAddress::new("PEER")).unwrap();
        orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Running));

        let effects =
            orchestrator.handle_event(OrchestratorEvent::ServerPeerPromoted(PeerAddress::new("X")));
        assert_eq!(
            effects,
            vec![Effect::Notify(OrchestratorNotice::ServerPeerRejected(
                PeerAddress::new("X")
            ))]
        );
        assert_eq!(orchestrator.route_send(), Ok(SendRoute::Client));
    }

    #[test]
    fn test_client_keeps_role_while_retrying() {
        let mut orchestrator = started();
        let effects = orchestrator.select_peer(PeerAddress::new("PEER")).unwrap();
        assert!(effects.contains(&Effect::Notify(OrchestratorNotice::RoleChanged(
            ConnectionRole::Client
        ))));
        orchestrator.handle_event(OrchestratorEvent::Bound(ServiceKind::GattClient));
        orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Running));
        orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Unhealthy));
        assert_eq!(orchestrator.role(), ConnectionRole::Client);

        let effects =
            orchestrator.handle_event(OrchestratorEvent::ServerPeerPromoted(PeerAddress::new("X")));
        assert_eq!(
            effects,
            vec![Effect::Notify(OrchestratorNotice::ServerPeerRejected(
                PeerAddress::new("X")
            ))]
        );

        let effects = orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Running));
        assert!(effects.is_empty());
        assert_eq!(orchestrator.role(), ConnectionRole::Client);
        assert_eq!(orchestrator.server_peer(), None);
        assert_eq!(orchestrator.route_send(), Ok(SendRoute::Client));
    }

    #[test]
    fn test_client_running_without_role_is_unbound() {
        let mut orchestrator = started();
        orchestrator.select_peer(PeerAddress::new("PEER")).unwrap();
        orchestrator.handle_event(OrchestratorEvent::Bound(ServiceKind::GattClient));
        orchestrator.roles.release(ConnectionRole::Client);
        orchestrator.roles.try_acquire(ConnectionRole::Server).unwrap();

        let effects = orchestrator.handle_event(OrchestratorEvent::ClientState(ServiceState::Running));
        assert_eq!(
            directives(&effects),
            vec![Directive::Unbind(ServiceKind::GattClient)]
        );
        assert_eq!(orchestrator.role(), ConnectionRole::Server);
    }

    #[test]
    fn test_failed_client_bind_releases_role() {
        let mut orchestrator = started();
        orchestrator.select_peer(PeerAddress::new("PEER")).unwrap();
        assert_eq!(orchestrator.role(), ConnectionRole::Client);

        orchestrator.handle_event(OrchestratorEvent::BindFailed(ServiceKind::GattClient));
        assert_eq!(orchestrator.role(), ConnectionRole::None);
        assert!(orchestrator.select_peer(PeerAddress::new("PEER")).is_ok());
    }

    #[test]
    fn test_route_send_follows_role() {
        let mut orchestrator = started();
        assert_eq!(
            orchestrator.route_send(),
            Err(OrchestratorError::NoActivePeer)
        );
        orchestrator.handle_event(OrchestratorEvent::ServerPeerPromoted(PeerAddress::new("A")));
        assert_eq!(
            orchestrator.route_send(),
            Ok(SendRoute::Server(PeerAddress::new("A")))
        );
        orchestrator.handle_event(OrchestratorEvent::ServerPeerLost(PeerAddress::new("A")));
        assert_eq!(orchestrator.role(), ConnectionRole::None);
    }

    #[test]
    fn test_stale_rebind_timer_is_dropped() {
        let mut orchestrator = started();
        let first = orchestrator.handle_event(OrchestratorEvent::Destroyed(ServiceKind::Scanner));
        let stale = rebind_timer(&first).unwrap();
        orchestrator.handle_event(OrchestratorEvent::SessionLost(ServiceKind::Scanner));
        assert!(orchestrator.handle_timer(stale).is_empty());
        assert_eq!(
            orchestrator.binding(ServiceKind::Scanner),
            ConnectionBindingState::Unhealthy
        );
    }

    #[test]
    fn test_role_register_is_exclusive() {
        let mut roles = RoleRegister::new();
        roles.try_acquire(ConnectionRole::Client).unwrap();
        roles.try_acquire(ConnectionRole::Client).unwrap();
        assert_eq!(
            roles.try_acquire(ConnectionRole::Server),
            Err(OrchestratorError::RoleHeld {
                held: ConnectionRole::Client
            })
        );
        assert!(!roles.release(ConnectionRole::Server));
        assert!(roles.release(ConnectionRole::Client));
        assert_eq!(roles.current(), ConnectionRole::None);
    }
}
