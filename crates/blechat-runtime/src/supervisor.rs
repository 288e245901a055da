//! Supervisor Task
//!
//! Runs the orchestrator against real session drivers:
//! - Executes bind/unbind directives by spawning and stopping drivers
//! - Maps session notices into orchestrator events and app events
//! - Owns the chat log and the discovered peer list
//! - Graceful shutdown coordination

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use blechat_core::{
    orchestrator::{Capabilities, Environment, OrchestratorEffect},
    session::{
        AdvertiserNotice, FilterMode, GattClientNotice, GattServerNotice, ScanMode,
        ScannerNotice, WriteOutcome,
    },
    ChatLog, DiscoveredPeer, Direction, Directive, Effect, Orchestrator, OrchestratorError,
    OrchestratorEvent, OrchestratorNotice, PeerAddress, SendRoute, ServiceKind, SessionConfig,
    TimerToken,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::channel::{AppEvent, ChatCommand, Snapshot};
use crate::drivers::{
    self, AdvertiserHandle, GattClientHandle, GattServerHandle, NoticeSender, ScannerHandle,
    SessionNotice,
};
use crate::error::{Result, RuntimeError};
use crate::radio::{RadioAdapter, RadioLeases};
use crate::timers::TimerSet;

/// How long shutdown waits for drivers to report teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

/// Application-level choices the supervisor applies when binding sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub advertising_payload: Vec<u8>,
    pub filter_mode: FilterMode,
    pub scan_mode: ScanMode,
    /// Start a scan as soon as the scanner is bound
    pub scan_on_bind: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            advertising_payload: blechat_core::protocol::DEFAULT_ADVERTISING_PAYLOAD
                .as_bytes()
                .to_vec(),
            filter_mode: FilterMode::ServiceFiltered,
            scan_mode: ScanMode::Interval,
            scan_on_bind: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Supervisor Task
// ----------------------------------------------------------------------------

pub struct SupervisorTask {
    adapter: Arc<dyn RadioAdapter>,
    leases: RadioLeases,
    orchestrator: Orchestrator,
    config: SessionConfig,
    settings: ChatSettings,
    max_advertising_len: usize,
    rssi_filter: bool,

    // Session handles
    advertiser: Option<AdvertiserHandle>,
    scanner: Option<ScannerHandle>,
    server: Option<GattServerHandle>,
    client: Option<GattClientHandle>,
    tasks: Vec<JoinHandle<()>>,

    // State mirrored for the application
    chat: ChatLog,
    peers: Vec<DiscoveredPeer>,

    // Channels
    commands: mpsc::UnboundedReceiver<ChatCommand>,
    app_events: mpsc::UnboundedSender<AppEvent>,
    notices_tx: NoticeSender,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    timers: TimerSet,
    timer_rx: mpsc::UnboundedReceiver<TimerToken>,

    running: bool,
}

impl SupervisorTask {
    pub fn new(
        adapter: Arc<dyn RadioAdapter>,
        config: SessionConfig,
        settings: ChatSettings,
        commands: mpsc::UnboundedReceiver<ChatCommand>,
        app_events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            leases: RadioLeases::new(),
            orchestrator: Orchestrator::new(config.rebind_delay),
            rssi_filter: config.rssi_filter_enabled,
            config,
            settings,
            max_advertising_len: 0,
            advertiser: None,
            scanner: None,
            server: None,
            client: None,
            tasks: Vec::new(),
            chat: ChatLog::new(),
            peers: Vec::new(),
            commands,
            app_events,
            notices_tx,
            notices,
            timers: TimerSet::new(timer_tx),
            timer_rx,
            running: false,
        }
    }

    /// Check capabilities and bind the always-on sessions
    pub async fn start(&mut self, capabilities: Capabilities, environment: Environment) -> Result<()> {
        info!("Starting supervisor");
        self.max_advertising_len = capabilities.max_advertising_data_len;
        let effects = self.orchestrator.start(capabilities, environment)?;
        self.apply(effects).await;
        self.running = true;
        Ok(())
    }

    /// Run the supervisor main loop
    pub async fn run(mut self) -> Result<()> {
        info!("Supervisor task running");

        while self.running {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.shutdown().await,
                },
                Some(notice) = self.notices.recv() => self.handle_notice(notice).await,
                Some(timer) = self.timer_rx.recv() => {
                    let effects = self.orchestrator.handle_timer(timer);
                    self.apply(effects).await;
                }
            }
        }

        info!("Supervisor task stopped");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: ChatCommand) {
        debug!("Command: {:?}", command);
        match command {
            ChatCommand::SelectPeer(index) => {
                let Some(peer) = self.peers.get(index) else {
                    self.publish(AppEvent::Rejected(OrchestratorError::UnknownPeer { index }));
                    return;
                };
                match self.orchestrator.select_peer(peer.address.clone()) {
                    Ok(effects) => self.apply(effects).await,
                    Err(err) => self.publish(AppEvent::Rejected(err)),
                }
            }
            ChatCommand::Send(text) => self.send(text),
            ChatCommand::StartScan(mode) => {
                if let Some(mode) = mode {
                    self.settings.scan_mode = mode;
                }
                match &self.scanner {
                    Some(scanner) => {
                        let _ = scanner.start(self.settings.filter_mode, self.settings.scan_mode);
                    }
                    None => warn!(
                        "No scanner bound ({})",
                        self.orchestrator.binding(ServiceKind::Scanner)
                    ),
                }
            }
            ChatCommand::StopScan => {
                if let Some(scanner) = &self.scanner {
                    let _ = scanner.stop();
                }
            }
            ChatCommand::SetRssiFilter(enabled) => {
                self.rssi_filter = enabled;
                if let Some(scanner) = &self.scanner {
                    let _ = scanner.set_rssi_filter(enabled);
                }
            }
            ChatCommand::ResetPeers => {
                if let Some(scanner) = &self.scanner {
                    let _ = scanner.reset();
                }
                self.peers.clear();
                self.publish(AppEvent::PeersReset);
            }
            ChatCommand::UpdateAdvertisement(payload) => {
                self.settings.advertising_payload = payload.clone();
                if let Some(advertiser) = &self.advertiser {
                    let _ = advertiser.update_payload(payload);
                }
            }
            ChatCommand::SetEnvironment(environment) => {
                self.feed(OrchestratorEvent::EnvironmentChanged(environment))
                    .await;
            }
            ChatCommand::Disconnect => match &self.client {
                Some(client) => {
                    let _ = client.disconnect();
                }
                None => self.publish(AppEvent::Rejected(OrchestratorError::NoActivePeer)),
            },
            ChatCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ChatCommand::Shutdown => self.shutdown().await,
        }
    }

    fn send(&mut self, text: String) {
        let submitted = match self.orchestrator.route_send() {
            Ok(SendRoute::Client) => self.client.as_ref().map(|c| c.submit_text(text)),
            Ok(SendRoute::Server(device)) => {
                self.server.as_ref().map(|s| s.submit_to_peer(device, text))
            }
            Err(err) => {
                self.publish(AppEvent::Rejected(err));
                return;
            }
        };
        match submitted {
            Some(Ok(())) => {}
            Some(Err(err)) => warn!("Send not queued: {}", err),
            None => self.publish(AppEvent::Rejected(OrchestratorError::NoActivePeer)),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            role: self.orchestrator.role(),
            client_state: self.orchestrator.client_state(),
            bindings: ServiceKind::ALL
                .into_iter()
                .map(|kind| (kind, self.orchestrator.binding(kind)))
                .collect(),
            scanning: self.orchestrator.is_scanning(),
            rssi_filter: self.rssi_filter,
            server_peer: self.orchestrator.server_peer().cloned(),
            environment: self.orchestrator.environment(),
            peers: self.peers.clone(),
            messages: self.chat.messages().to_vec(),
        }
    }

    // ------------------------------------------------------------------------
    // Session Notices
    // ------------------------------------------------------------------------

    async fn handle_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::Advertiser(notice) => match notice {
                AdvertiserNotice::StateChanged(change) => {
                    let state = change.state;
                    self.publish(AppEvent::SessionState {
                        kind: ServiceKind::Advertiser,
                        change,
                    });
                    self.feed(OrchestratorEvent::AdvertiserState(state)).await;
                }
                AdvertiserNotice::Destroyed => {
                    self.advertiser = None;
                    self.feed(OrchestratorEvent::Destroyed(ServiceKind::Advertiser))
                        .await;
                }
            },
            SessionNotice::Scanner(notice) => self.handle_scanner_notice(notice).await,
            SessionNotice::Server(notice) => self.handle_server_notice(notice).await,
            SessionNotice::ServerSent {
                device,
                text,
                accepted,
            } => {
                if accepted {
                    debug!("Notification queued for {}", device);
                    let message = self.chat.push(text, Direction::FromLocal).clone();
                    self.publish(AppEvent::MessageSent(message));
                } else {
                    let outcome = if text.len() > self.config.max_message_bytes {
                        WriteOutcome::TooLong
                    } else {
                        WriteOutcome::Failed
                    };
                    self.publish(AppEvent::SendFailed { text, outcome });
                }
            }
            SessionNotice::Client(notice) => self.handle_client_notice(notice).await,
            SessionNotice::Lost(kind) => {
                self.drop_handle(kind);
                self.feed(OrchestratorEvent::SessionLost(kind)).await;
            }
        }
    }

    async fn handle_scanner_notice(&mut self, notice: ScannerNotice) {
        match notice {
            ScannerNotice::StateChanged(change) => self.publish(AppEvent::SessionState {
                kind: ServiceKind::Scanner,
                change,
            }),
            ScannerNotice::StatusChanged(scanning) => {
                self.publish(AppEvent::ScanStatus(scanning));
                self.feed(OrchestratorEvent::ScanStatus(scanning)).await;
            }
            ScannerNotice::PeerDiscovered(peer) => {
                let index = self.peers.len();
                self.peers.push(peer.clone());
                self.publish(AppEvent::PeerDiscovered { index, peer });
            }
            ScannerNotice::PeerUpdated(peer) => {
                if let Some(index) = self.peers.iter().position(|p| p.address == peer.address) {
                    self.peers[index] = peer.clone();
                    self.publish(AppEvent::PeerUpdated { index, peer });
                }
            }
            ScannerNotice::Destroyed => {
                self.scanner = None;
                self.feed(OrchestratorEvent::Destroyed(ServiceKind::Scanner))
                    .await;
            }
        }
    }

    async fn handle_server_notice(&mut self, notice: GattServerNotice) {
        match notice {
            GattServerNotice::StateChanged(change) => {
                let state = change.state;
                self.publish(AppEvent::SessionState {
                    kind: ServiceKind::GattServer,
                    change,
                });
                self.feed(OrchestratorEvent::ServerState(state)).await;
            }
            GattServerNotice::ClientConnected(device) => {
                self.feed(OrchestratorEvent::ServerPeerPromoted(device.clone()))
                    .await;
                if self.orchestrator.server_peer() == Some(&device) {
                    self.publish(AppEvent::ServerPeerConnected(device));
                }
            }
            GattServerNotice::ClientDisconnected(device) => {
                if self.orchestrator.server_peer() == Some(&device) {
                    self.publish(AppEvent::ServerPeerDisconnected(device.clone()));
                }
                self.feed(OrchestratorEvent::ServerPeerLost(device)).await;
            }
            GattServerNotice::MessageReceived { device, text } => {
                debug!("Message from {}", device);
                self.record_inbound(text);
            }
            GattServerNotice::Destroyed => {
                self.server = None;
                self.feed(OrchestratorEvent::Destroyed(ServiceKind::GattServer))
                    .await;
            }
        }
    }

    async fn handle_client_notice(&mut self, notice: GattClientNotice) {
        match notice {
            GattClientNotice::StateChanged(change) => {
                let state = change.state;
                self.publish(AppEvent::SessionState {
                    kind: ServiceKind::GattClient,
                    change,
                });
                self.feed(OrchestratorEvent::ClientState(state)).await;
            }
            GattClientNotice::MessageReceived(text) => self.record_inbound(text),
            GattClientNotice::WriteResult { outcome, text } => {
                if outcome.is_success() {
                    let message = self.chat.push(text, Direction::FromLocal).clone();
                    self.publish(AppEvent::MessageSent(message));
                } else {
                    self.publish(AppEvent::SendFailed { text, outcome });
                }
            }
            GattClientNotice::Destroyed => {
                self.client = None;
                self.feed(OrchestratorEvent::Destroyed(ServiceKind::GattClient))
                    .await;
            }
        }
    }

    fn record_inbound(&mut self, text: String) {
        let message = self.chat.push(text, Direction::FromPeer).clone();
        self.publish(AppEvent::MessageReceived(message));
    }

    // ------------------------------------------------------------------------
    // Orchestrator Effects
    // ------------------------------------------------------------------------

    async fn feed(&mut self, event: OrchestratorEvent) {
        let effects = self.orchestrator.handle_event(event);
        self.apply(effects).await;
    }

    /// Execute effects, feeding bind outcomes back until nothing is left
    async fn apply(&mut self, effects: Vec<OrchestratorEffect>) {
        let mut queue: VecDeque<OrchestratorEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Radio(directive) | Effect::RadioFor { command: directive, .. } => {
                    if let Some(event) = self.execute(directive).await {
                        queue.extend(self.orchestrator.handle_event(event));
                    }
                }
                Effect::StartTimer { timer, after } => self.timers.start(timer, after),
                Effect::CancelTimer(kind) => self.timers.cancel(kind),
                Effect::Notify(notice) => self.publish_orchestrator_notice(notice),
            }
        }
    }

    async fn execute(&mut self, directive: Directive) -> Option<OrchestratorEvent> {
        match directive {
            Directive::Bind { kind, peer } => match self.bind(kind, peer).await {
                Ok(()) => Some(OrchestratorEvent::Bound(kind)),
                Err(err) => {
                    warn!("Could not bind {}: {}", kind, err);
                    self.publish(AppEvent::BindFailed {
                        kind,
                        reason: err.to_string(),
                    });
                    Some(OrchestratorEvent::BindFailed(kind))
                }
            },
            Directive::Unbind(kind) => {
                if self.stop_session(kind) {
                    None
                } else {
                    debug!("No live {} session to unbind", kind);
                    Some(OrchestratorEvent::Destroyed(kind))
                }
            }
            Directive::StopScan => {
                if let Some(scanner) = &self.scanner {
                    let _ = scanner.stop();
                }
                None
            }
        }
    }

    async fn bind(&mut self, kind: ServiceKind, peer: Option<PeerAddress>) -> Result<()> {
        let lease = self.leases.acquire(kind)?;
        let notices = self.notices_tx.clone();

        let task = match kind {
            ServiceKind::Advertiser => {
                let link = self.adapter.advertiser().await?;
                let (handle, task) = drivers::advertiser::spawn(
                    link,
                    lease,
                    self.settings.advertising_payload.clone(),
                    self.max_advertising_len,
                    notices,
                );
                self.advertiser = Some(handle);
                task
            }
            ServiceKind::Scanner => {
                let link = self.adapter.scanner().await?;
                let (handle, task) = drivers::scanner::spawn(link, lease, &self.config, notices);
                if self.rssi_filter != self.config.rssi_filter_enabled {
                    handle.set_rssi_filter(self.rssi_filter)?;
                }
                if self.settings.scan_on_bind {
                    handle.start(self.settings.filter_mode, self.settings.scan_mode)?;
                }
                self.scanner = Some(handle);
                task
            }
            ServiceKind::GattServer => {
                let link = self.adapter.gatt_server().await?;
                let (handle, task) = drivers::gatt_server::spawn(link, lease, &self.config, notices);
                self.server = Some(handle);
                task
            }
            ServiceKind::GattClient => {
                let peer = peer.ok_or(RuntimeError::Orchestrator(OrchestratorError::NoActivePeer))?;
                let link = self.adapter.gatt_client().await?;
                let (handle, task) =
                    drivers::gatt_client::spawn(link, lease, peer, &self.config, notices);
                self.client = Some(handle);
                task
            }
        };

        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
        Ok(())
    }

    /// Ask the session to tear down. Returns false if there was none.
    fn stop_session(&mut self, kind: ServiceKind) -> bool {
        let sent = match kind {
            ServiceKind::Advertiser => self.advertiser.as_ref().map(|h| h.stop()),
            ServiceKind::Scanner => self.scanner.as_ref().map(|h| h.close()),
            ServiceKind::GattServer => self.server.as_ref().map(|h| h.stop()),
            ServiceKind::GattClient => self.client.as_ref().map(|h| h.disconnect()),
        };
        matches!(sent, Some(Ok(())))
    }

    fn drop_handle(&mut self, kind: ServiceKind) {
        match kind {
            ServiceKind::Advertiser => self.advertiser = None,
            ServiceKind::Scanner => self.scanner = None,
            ServiceKind::GattServer => self.server = None,
            ServiceKind::GattClient => self.client = None,
        }
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    fn publish_orchestrator_notice(&mut self, notice: OrchestratorNotice) {
        let event = match notice {
            OrchestratorNotice::BindingChanged { kind, state } => {
                AppEvent::BindingChanged { kind, state }
            }
            OrchestratorNotice::RoleChanged(role) => {
                info!("Connection role: {}", role);
                AppEvent::RoleChanged(role)
            }
            OrchestratorNotice::ServerPeerRejected(device) => AppEvent::ServerPeerRejected(device),
        };
        self.publish(event);
    }

    fn publish(&self, event: AppEvent) {
        if self.app_events.send(event).is_err() {
            debug!("No listener for app events");
        }
    }

    /// Unbind everything and wait for the drivers to finish
    async fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        info!("Supervisor shutdown requested");
        let effects = self.orchestrator.unbind_all();
        self.apply(effects).await;

        let tasks = std::mem::take(&mut self.tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Session drivers did not stop within {:?}", SHUTDOWN_GRACE);
        }

        while let Ok(notice) = self.notices.try_recv() {
            self.handle_notice(notice).await;
        }
        self.timers.cancel_all();
        self.running = false;
        self.publish(AppEvent::Stopped);
        info!("All sessions shut down");
    }
}
