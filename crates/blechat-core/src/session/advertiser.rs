//! Advertiser session
//!
//! Publishes the chat service UUID together with a small service-data payload.
//! The advertisement runs for the whole lifetime of the session and is only
//! stopped by teardown.

use tracing::{debug, info, warn};

use crate::effects::Effect;
use crate::errors::SessionError;
use crate::protocol::{check_advertising_size, AdvertisementData, AdvertisingParameters};
use crate::session::StateChange;
use crate::types::{Generation, RadioStatus, ServiceState};

// ----------------------------------------------------------------------------
// Commands, Events, Notices
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AdvertiserCommand {
    StartAdvertisingSet {
        parameters: AdvertisingParameters,
        data: AdvertisementData,
    },
    SetAdvertisingData(AdvertisementData),
    StopAdvertisingSet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvertiserEvent {
    SetStarted { status: RadioStatus },
    /// The platform stopped the set on its own
    SetStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvertiserNotice {
    StateChanged(StateChange),
    Destroyed,
}

pub type AdvertiserEffect = Effect<AdvertiserCommand, AdvertiserNotice>;

// ----------------------------------------------------------------------------
// Advertiser
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Advertiser {
    state: ServiceState,
    generation: Generation,
    parameters: AdvertisingParameters,
    payload: Vec<u8>,
    max_advertising_len: usize,
    destroyed: bool,
}

impl Advertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters(parameters: AdvertisingParameters) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Begin advertising `payload`
    ///
    /// `max_advertising_len` is the platform limit queried at runtime. The
    /// payload must be strictly shorter; otherwise nothing is sent and the
    /// state does not change.
    pub fn start(
        &mut self,
        payload: Vec<u8>,
        max_advertising_len: usize,
    ) -> Result<Vec<AdvertiserEffect>, SessionError> {
        if self.destroyed || self.state != ServiceState::Idle {
            return Err(SessionError::InvalidState {
                operation: "start advertising",
                state: self.state,
            });
        }
        check_advertising_size(&payload, max_advertising_len)?;

        self.generation.bump();
        self.max_advertising_len = max_advertising_len;
        self.payload = payload;
        self.state = ServiceState::Starting;
        info!("Starting advertisement ({} byte payload)", self.payload.len());

        Ok(vec![
            Effect::Notify(AdvertiserNotice::StateChanged(StateChange::new(
                ServiceState::Starting,
            ))),
            Effect::Radio(AdvertiserCommand::StartAdvertisingSet {
                parameters: self.parameters.clone(),
                data: AdvertisementData::for_chat(self.payload.clone()),
            }),
        ])
    }

    /// Replace the advertised data on a live set
    ///
    /// Oversized payloads and calls before the set is live are ignored and the
    /// previous data stays on air.
    pub fn update_payload(&mut self, payload: Vec<u8>) -> Vec<AdvertiserEffect> {
        if self.state != ServiceState::Running {
            debug!("Ignoring payload update while {}", self.state);
            return Vec::new();
        }
        if let Err(err) = check_advertising_size(&payload, self.max_advertising_len) {
            warn!("Keeping previous advertisement: {}", err);
            return Vec::new();
        }
        self.payload = payload;
        vec![Effect::Radio(AdvertiserCommand::SetAdvertisingData(
            AdvertisementData::for_chat(self.payload.clone()),
        ))]
    }

    pub fn handle_event(
        &mut self,
        generation: Generation,
        event: AdvertiserEvent,
    ) -> Vec<AdvertiserEffect> {
        if self.destroyed || generation != self.generation {
            debug!("Dropping stale advertiser event {:?} ({})", event, generation);
            return Vec::new();
        }

        match (self.state, event) {
            (ServiceState::Starting, AdvertiserEvent::SetStarted { status }) => {
                if status.is_success() {
                    info!("Advertisement set is live");
                    self.enter(StateChange::new(ServiceState::Running))
                } else {
                    warn!("Advertisement set failed to start: status {}", status.0);
                    self.enter(StateChange::because(
                        ServiceState::StartFailed,
                        SessionError::RadioRejected { status: status.0 },
                    ))
                }
            }
            (ServiceState::Starting | ServiceState::Running, AdvertiserEvent::SetStopped) => {
                warn!("Advertisement set stopped while still bound");
                self.enter(StateChange::new(ServiceState::Unhealthy))
            }
            (state, event) => {
                debug!("Ignoring {:?} while {}", event, state);
                Vec::new()
            }
        }
    }

    /// Tear the session down. Safe to call repeatedly.
    pub fn stop(&mut self) -> Vec<AdvertiserEffect> {
        if self.destroyed {
            return Vec::new();
        }
        self.destroyed = true;
        self.generation.bump();

        let mut effects = Vec::new();
        if self.state != ServiceState::Idle {
            effects.push(Effect::Radio(AdvertiserCommand::StopAdvertisingSet));
        }
        effects.extend(self.enter(StateChange::new(ServiceState::Stopping)));
        effects.extend(self.enter(StateChange::new(ServiceState::Stopped)));
        effects.push(Effect::Notify(AdvertiserNotice::Destroyed));
        info!("Advertiser torn down");
        effects
    }

    fn enter(&mut self, change: StateChange) -> Vec<AdvertiserEffect> {
        self.state = change.state;
        vec![Effect::Notify(AdvertiserNotice::StateChanged(change))]
    }
}
