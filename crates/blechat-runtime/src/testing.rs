//! Scripted radio for tests and dry runs
//!
//! [`ScriptedRadio`] records every command the sessions issue and keeps the
//! most recent [`EventSink`] of each session, so a test can answer commands by
//! hand. With auto-respond on it plays a cooperative peer: every start
//! succeeds, the chat service is discovered, and writes are acknowledged.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use blechat_core::{
    orchestrator::Capabilities,
    protocol::DiscoveredService,
    session::{
        AdvertiserCommand, AdvertiserEvent, GattClientCommand, GattClientEvent,
        GattServerCommand, GattServerEvent, LinkState, ScannerCommand, ScannerEvent,
    },
    RadioStatus, ServiceKind, INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID,
    SERVICE_UUID,
};

use crate::error::RadioError;
use crate::radio::{
    AdvertiserLink, EventSink, GattClientLink, GattServerLink, RadioAdapter, RadioLink,
    ScannerLink,
};

/// A command as seen by the radio
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Advertiser(AdvertiserCommand),
    Scanner(ScannerCommand),
    Server(GattServerCommand),
    Client(GattClientCommand),
}

impl RecordedCommand {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Advertiser(_) => ServiceKind::Advertiser,
            Self::Scanner(_) => ServiceKind::Scanner,
            Self::Server(_) => ServiceKind::GattServer,
            Self::Client(_) => ServiceKind::GattClient,
        }
    }
}

#[derive(Default)]
struct Script {
    commands: Vec<RecordedCommand>,
    auto_respond: bool,
    /// Report `Disconnected` after a client `Disconnect`, as some stacks do
    answer_disconnects: bool,
    /// Kinds whose commands are refused
    failing: HashSet<ServiceKind>,
    /// Kinds the adapter will not hand out
    unavailable: HashSet<ServiceKind>,
    advertiser: Option<EventSink<AdvertiserEvent>>,
    scanner: Option<EventSink<ScannerEvent>>,
    server: Option<EventSink<GattServerEvent>>,
    client: Option<EventSink<GattClientEvent>>,
}

#[derive(Clone)]
pub struct ScriptedRadio {
    script: Arc<Mutex<Script>>,
    capabilities: Capabilities,
}

impl Default for ScriptedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRadio {
    /// A silent radio: commands are recorded and never answered
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            capabilities: Capabilities::full(31),
        }
    }

    /// A radio that answers like a cooperative peer
    pub fn cooperative() -> Self {
        let radio = Self::new();
        radio.lock().auto_respond = true;
        radio
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_auto_respond(&self, enabled: bool) {
        self.lock().auto_respond = enabled;
    }

    pub fn set_answer_disconnects(&self, enabled: bool) {
        self.lock().answer_disconnects = enabled;
    }

    /// Refuse every command of `kind` from now on
    pub fn fail_commands_for(&self, kind: ServiceKind) {
        self.lock().failing.insert(kind);
    }

    /// Refuse to create links of `kind`
    pub fn make_unavailable(&self, kind: ServiceKind) {
        self.lock().unavailable.insert(kind);
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.lock().commands.clone()
    }

    pub fn commands_for(&self, kind: ServiceKind) -> Vec<RecordedCommand> {
        self.lock()
            .commands
            .iter()
            .filter(|command| command.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn client_commands(&self) -> Vec<GattClientCommand> {
        self.lock()
            .commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::Client(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn server_commands(&self) -> Vec<GattServerCommand> {
        self.lock()
            .commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::Server(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    // ------------------------------------------------------------------------
    // Event Injection
    // ------------------------------------------------------------------------

    /// Deliver an event on the advertiser's latest sink
    pub fn inject_advertiser(&self, event: AdvertiserEvent) -> bool {
        self.lock().advertiser.as_ref().map_or(false, |sink| sink.emit(event))
    }

    pub fn inject_scanner(&self, event: ScannerEvent) -> bool {
        self.lock().scanner.as_ref().map_or(false, |sink| sink.emit(event))
    }

    pub fn inject_server(&self, event: GattServerEvent) -> bool {
        self.lock().server.as_ref().map_or(false, |sink| sink.emit(event))
    }

    pub fn inject_client(&self, event: GattClientEvent) -> bool {
        self.lock().client.as_ref().map_or(false, |sink| sink.emit(event))
    }

    /// The client's latest sink, for replaying events under an old generation
    pub fn client_sink(&self) -> Option<EventSink<GattClientEvent>> {
        self.lock().client.clone()
    }

    fn record(&self, command: RecordedCommand) -> Result<bool, RadioError> {
        let mut script = self.lock();
        let kind = command.kind();
        script.commands.push(command);
        if script.failing.contains(&kind) {
            return Err(RadioError::Platform(format!("{} command refused", kind)));
        }
        Ok(script.auto_respond)
    }
}

/// The services a cooperative peer exposes
pub fn chat_services() -> Vec<DiscoveredService> {
    vec![DiscoveredService {
        uuid: SERVICE_UUID,
        characteristics: vec![INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID],
    }]
}

// ----------------------------------------------------------------------------
// Links
// ----------------------------------------------------------------------------

struct ScriptedAdvertiserLink {
    radio: ScriptedRadio,
}

#[async_trait]
impl RadioLink for ScriptedAdvertiserLink {
    type Command = AdvertiserCommand;
    type Event = AdvertiserEvent;

    async fn execute(
        &mut self,
        command: AdvertiserCommand,
        sink: EventSink<AdvertiserEvent>,
    ) -> Result<(), RadioError> {
        self.radio.lock().advertiser = Some(sink.clone());
        if !self.radio.record(RecordedCommand::Advertiser(command.clone()))? {
            return Ok(());
        }
        match command {
            AdvertiserCommand::StartAdvertisingSet { .. } => {
                sink.emit(AdvertiserEvent::SetStarted {
                    status: RadioStatus::SUCCESS,
                });
            }
            AdvertiserCommand::StopAdvertisingSet => {
                sink.emit(AdvertiserEvent::SetStopped);
            }
            AdvertiserCommand::SetAdvertisingData(_) => {}
        }
        Ok(())
    }
}

struct ScriptedScannerLink {
    radio: ScriptedRadio,
}

#[async_trait]
impl RadioLink for ScriptedScannerLink {
    type Command = ScannerCommand;
    type Event = ScannerEvent;

    async fn execute(
        &mut self,
        command: ScannerCommand,
        sink: EventSink<ScannerEvent>,
    ) -> Result<(), RadioError> {
        self.radio.lock().scanner = Some(sink);
        self.radio.record(RecordedCommand::Scanner(command))?;
        Ok(())
    }
}

struct ScriptedServerLink {
    radio: ScriptedRadio,
}

#[async_trait]
impl RadioLink for ScriptedServerLink {
    type Command = GattServerCommand;
    type Event = GattServerEvent;

    async fn execute(
        &mut self,
        command: GattServerCommand,
        sink: EventSink<GattServerEvent>,
    ) -> Result<(), RadioError> {
        self.radio.lock().server = Some(sink.clone());
        if !self.radio.record(RecordedCommand::Server(command.clone()))? {
            return Ok(());
        }
        if let GattServerCommand::AddService(_) = command {
            sink.emit(GattServerEvent::ServiceAdded {
                status: RadioStatus::SUCCESS,
            });
        }
        Ok(())
    }
}

struct ScriptedClientLink {
    radio: ScriptedRadio,
}

#[async_trait]
impl RadioLink for ScriptedClientLink {
    type Command = GattClientCommand;
    type Event = GattClientEvent;

    async fn execute(
        &mut self,
        command: GattClientCommand,
        sink: EventSink<GattClientEvent>,
    ) -> Result<(), RadioError> {
        let answer_disconnects = {
            let mut script = self.radio.lock();
            script.client = Some(sink.clone());
            script.answer_disconnects
        };
        let respond = self.radio.record(RecordedCommand::Client(command.clone()))?;
        if answer_disconnects && command == GattClientCommand::Disconnect {
            sink.emit(GattClientEvent::ConnectionStateChanged {
                status: RadioStatus::SUCCESS,
                link: LinkState::Disconnected,
            });
            return Ok(());
        }
        if !respond {
            return Ok(());
        }
        let status = RadioStatus::SUCCESS;
        // Unless asked otherwise, disconnects are never answered
        let answer = match command {
            GattClientCommand::Connect { .. } | GattClientCommand::Reconnect => {
                Some(GattClientEvent::ConnectionStateChanged {
                    status,
                    link: LinkState::Connected,
                })
            }
            GattClientCommand::RequestMtu(mtu) => Some(GattClientEvent::MtuChanged { mtu, status }),
            GattClientCommand::DiscoverServices => Some(GattClientEvent::ServicesDiscovered {
                status,
                services: chat_services(),
            }),
            GattClientCommand::WriteCharacteristic { .. } => {
                Some(GattClientEvent::CharacteristicWrite { status })
            }
            GattClientCommand::Disconnect
            | GattClientCommand::Close
            | GattClientCommand::SetNotifications { .. } => None,
        };
        if let Some(event) = answer {
            sink.emit(event);
        }
        Ok(())
    }
}

#[async_trait]
impl RadioAdapter for ScriptedRadio {
    async fn capabilities(&self) -> Result<Capabilities, RadioError> {
        Ok(self.capabilities)
    }

    async fn advertiser(&self) -> Result<AdvertiserLink, RadioError> {
        self.check_available(ServiceKind::Advertiser)?;
        Ok(Box::new(ScriptedAdvertiserLink {
            radio: self.clone(),
        }))
    }

    async fn scanner(&self) -> Result<ScannerLink, RadioError> {
        self.check_available(ServiceKind::Scanner)?;
        Ok(Box::new(ScriptedScannerLink {
            radio: self.clone(),
        }))
    }

    async fn gatt_server(&self) -> Result<GattServerLink, RadioError> {
        self.check_available(ServiceKind::GattServer)?;
        Ok(Box::new(ScriptedServerLink {
            radio: self.clone(),
        }))
    }

    async fn gatt_client(&self) -> Result<GattClientLink, RadioError> {
        self.check_available(ServiceKind::GattClient)?;
        Ok(Box::new(ScriptedClientLink {
            radio: self.clone(),
        }))
    }
}

impl ScriptedRadio {
    fn check_available(&self, kind: ServiceKind) -> Result<(), RadioError> {
        if self.lock().unavailable.contains(&kind) {
            return Err(RadioError::NotSupported(kind));
        }
        Ok(())
    }
}
