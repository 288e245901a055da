//! GATT client driver
//!
//! Runs the resilience machine against a client link. Connection timeout,
//! retry backoff and settle delay all live in the driver's [`TimerSet`] and
//! die with it.
//!
//! [`TimerSet`]: crate::timers::TimerSet

use blechat_core::{
    session::{
        GattClient, GattClientCommand, GattClientEvent, GattClientNotice, LinkState,
        WriteOutcome,
    },
    Effect, PeerAddress, RadioStatus, ServiceKind, SessionConfig, TimerToken,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{spawn_supervised, NoticeSender, SessionIo, SessionNotice};
use crate::error::{Result, RuntimeError};
use crate::radio::{GattClientLink, Lease, Tagged};

#[derive(Debug)]
pub(crate) enum GattClientRequest {
    Send {
        text: String,
        reply: Option<oneshot::Sender<WriteOutcome>>,
    },
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct GattClientHandle {
    tx: mpsc::UnboundedSender<GattClientRequest>,
}

impl GattClientHandle {
    /// Write `text` and wait for the radio's write result
    pub async fn send_text(&self, text: impl Into<String>) -> WriteOutcome {
        let (reply, rx) = oneshot::channel();
        let request = GattClientRequest::Send {
            text: text.into(),
            reply: Some(reply),
        };
        if self.tx.send(request).is_err() {
            return WriteOutcome::Failed;
        }
        rx.await.unwrap_or(WriteOutcome::Failed)
    }

    /// Queue a write; the outcome arrives as a `WriteResult` notice
    pub fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        self.tx
            .send(GattClientRequest::Send {
                text: text.into(),
                reply: None,
            })
            .map_err(|_| RuntimeError::ChannelClosed("gatt client"))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.tx
            .send(GattClientRequest::Disconnect)
            .map_err(|_| RuntimeError::ChannelClosed("gatt client"))
    }
}

fn failure_event(command: &GattClientCommand) -> Option<GattClientEvent> {
    let status = RadioStatus::FAILURE;
    match command {
        GattClientCommand::Connect { .. } | GattClientCommand::Reconnect => {
            Some(GattClientEvent::ConnectionStateChanged {
                status,
                link: LinkState::Disconnected,
            })
        }
        GattClientCommand::RequestMtu(mtu) => Some(GattClientEvent::MtuChanged { mtu: *mtu, status }),
        GattClientCommand::DiscoverServices => Some(GattClientEvent::ServicesDiscovered {
            status,
            services: Vec::new(),
        }),
        GattClientCommand::WriteCharacteristic { .. } => {
            Some(GattClientEvent::CharacteristicWrite { status })
        }
        GattClientCommand::Disconnect
        | GattClientCommand::Close
        | GattClientCommand::SetNotifications { .. } => None,
    }
}

struct GattClientDriver {
    session: GattClient,
    io: SessionIo<GattClientCommand, GattClientEvent>,
    requests: mpsc::UnboundedReceiver<GattClientRequest>,
    events: mpsc::UnboundedReceiver<Tagged<GattClientEvent>>,
    timers: mpsc::UnboundedReceiver<TimerToken>,
    notices: NoticeSender,
    /// Caller waiting on the in-flight write
    pending_reply: Option<oneshot::Sender<WriteOutcome>>,
    _lease: Lease,
}

impl GattClientDriver {
    async fn run(mut self, peer: PeerAddress) {
        match self.session.connect(peer) {
            Ok(effects) => self.apply(effects).await,
            Err(err) => warn!("GATT client not started: {}", err),
        }

        while !self.session.is_destroyed() {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(GattClientRequest::Send { text, reply }) => self.send(text, reply).await,
                    Some(GattClientRequest::Disconnect) | None => {
                        let effects = self.session.disconnect();
                        self.apply(effects).await;
                    }
                },
                Some(tagged) = self.events.recv() => {
                    let effects = self.session.handle_event(tagged.generation, tagged.event);
                    self.apply(effects).await;
                }
                Some(timer) = self.timers.recv() => {
                    let effects = self.session.handle_timer(timer);
                    self.apply(effects).await;
                }
            }
        }

        self.io.cancel_timers();
        info!("GATT client driver stopped");
    }

    async fn send(&mut self, text: String, reply: Option<oneshot::Sender<WriteOutcome>>) {
        match self.session.send_text(&text) {
            Ok(effects) => {
                self.pending_reply = reply;
                self.apply(effects).await;
            }
            Err(err) => {
                debug!("Send rejected locally: {}", err);
                let outcome = WriteOutcome::from_error(&err);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        let _ = self.notices.send(SessionNotice::Client(
                            GattClientNotice::WriteResult { outcome, text },
                        ));
                    }
                }
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect<GattClientCommand, GattClientNotice>>) {
        let applied = self.io.apply(self.session.generation(), effects).await;
        for notice in applied.notices {
            if let GattClientNotice::WriteResult { outcome, .. } = &notice {
                if let Some(reply) = self.pending_reply.take() {
                    let _ = reply.send(*outcome);
                    continue;
                }
            }
            let _ = self.notices.send(SessionNotice::Client(notice));
        }
    }
}

pub(crate) fn spawn(
    link: GattClientLink,
    lease: Lease,
    peer: PeerAddress,
    config: &SessionConfig,
    notices: NoticeSender,
) -> (GattClientHandle, JoinHandle<()>) {
    let (request_tx, requests) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (timer_tx, timers) = mpsc::unbounded_channel();

    let driver = GattClientDriver {
        session: GattClient::new(config.clone()),
        io: SessionIo::new(ServiceKind::GattClient, link, events_tx, timer_tx, failure_event),
        requests,
        events,
        timers,
        notices: notices.clone(),
        pending_reply: None,
        _lease: lease,
    };
    let task = spawn_supervised(ServiceKind::GattClient, driver.run(peer), notices);
    (GattClientHandle { tx: request_tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{RadioAdapter, RadioLeases};
    use crate::testing::ScriptedRadio;
    use blechat_core::ServiceState;
    use std::time::Duration;

    async fn spawn_client(
        radio: &ScriptedRadio,
        config: &SessionConfig,
    ) -> (GattClientHandle, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let lease = RadioLeases::new().acquire(ServiceKind::GattClient).unwrap();
        let link = radio.gatt_client().await.unwrap();
        let (handle, _task) = spawn(link, lease, PeerAddress::new("peer"), config, notices_tx);
        (handle, notices)
    }

    async fn wait_for_state(
        notices: &mut mpsc::UnboundedReceiver<SessionNotice>,
        state: ServiceState,
    ) {
        while let Some(notice) = notices.recv().await {
            if let SessionNotice::Client(GattClientNotice::StateChanged(change)) = notice {
                if change.state == state {
                    return;
                }
            }
        }
        panic!("client never reached {}", state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_text_waits_for_write_result() {
        let radio = ScriptedRadio::cooperative();
        let config = SessionConfig::default().with_settle_delay(Duration::from_millis(100));
        let (handle, mut notices) = spawn_client(&radio, &config).await;
        wait_for_state(&mut notices, ServiceState::Running).await;

        assert_eq!(handle.send_text("hello").await, WriteOutcome::Success);
        assert_eq!(handle.send_text("X".repeat(301)).await, WriteOutcome::TooLong);

        radio.fail_commands_for(ServiceKind::GattClient);
        assert_eq!(handle.send_text("lost").await, WriteOutcome::Failed);

        handle.disconnect().unwrap();
        wait_for_state(&mut notices, ServiceState::Stopped).await;
        assert!(matches!(
            notices.recv().await,
            Some(SessionNotice::Client(GattClientNotice::Destroyed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_timeout_disconnect_costs_one_retry() {
        let radio = ScriptedRadio::new();
        radio.set_answer_disconnects(true);
        let config = SessionConfig::default();
        let (handle, mut notices) = spawn_client(&radio, &config).await;

        wait_for_state(&mut notices, ServiceState::Unhealthy).await;
        // Past the backoff, well short of the next connection timeout
        tokio::time::sleep(config.retry_backoff + Duration::from_millis(100)).await;

        let commands = radio.client_commands();
        assert!(commands.contains(&GattClientCommand::Disconnect));
        let reconnects = commands
            .iter()
            .filter(|c| **c == GattClientCommand::Reconnect)
            .count();
        assert_eq!(reconnects, 1);

        let mut retries = 0;
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::Client(GattClientNotice::StateChanged(change)) = notice {
                if change.state == ServiceState::Unhealthy {
                    retries += 1;
                }
            }
        }
        assert_eq!(retries, 0, "the answered disconnect was taken as a new drop");
        handle.disconnect().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_running_is_refused() {
        let radio = ScriptedRadio::new();
        let (handle, _notices) = spawn_client(&radio, &SessionConfig::default()).await;
        assert_eq!(handle.send_text("too early").await, WriteOutcome::Failed);
        handle.disconnect().unwrap();
    }
}
