//! GATT server driver

use blechat_core::{
    session::{GattServer, GattServerCommand, GattServerEvent, GattServerNotice},
    Effect, PeerAddress, RadioStatus, ServiceKind, SessionConfig, TimerToken,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{spawn_supervised, NoticeSender, SessionIo, SessionNotice};
use crate::error::{Result, RuntimeError};
use crate::radio::{GattServerLink, Lease, Tagged};

#[derive(Debug)]
pub(crate) enum GattServerRequest {
    Send {
        device: PeerAddress,
        text: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct GattServerHandle {
    tx: mpsc::UnboundedSender<GattServerRequest>,
}

impl GattServerHandle {
    /// Notify `device` and wait for the radio's acceptance
    ///
    /// `true` only means the platform queued the notification.
    pub async fn send_to_peer(&self, device: PeerAddress, text: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        let request = GattServerRequest::Send {
            device,
            text: text.into(),
            reply: Some(reply),
        };
        if self.tx.send(request).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Queue a send; the outcome arrives as [`SessionNotice::ServerSent`]
    pub fn submit_to_peer(&self, device: PeerAddress, text: impl Into<String>) -> Result<()> {
        self.tx
            .send(GattServerRequest::Send {
                device,
                text: text.into(),
                reply: None,
            })
            .map_err(|_| RuntimeError::ChannelClosed("gatt server"))
    }

    pub fn stop(&self) -> Result<()> {
        self.tx
            .send(GattServerRequest::Stop)
            .map_err(|_| RuntimeError::ChannelClosed("gatt server"))
    }
}

fn failure_event(command: &GattServerCommand) -> Option<GattServerEvent> {
    match command {
        GattServerCommand::AddService(_) => Some(GattServerEvent::ServiceAdded {
            status: RadioStatus::FAILURE,
        }),
        _ => None,
    }
}

struct GattServerDriver {
    session: GattServer,
    io: SessionIo<GattServerCommand, GattServerEvent>,
    requests: mpsc::UnboundedReceiver<GattServerRequest>,
    events: mpsc::UnboundedReceiver<Tagged<GattServerEvent>>,
    timers: mpsc::UnboundedReceiver<TimerToken>,
    notices: NoticeSender,
    _lease: Lease,
}

impl GattServerDriver {
    async fn run(mut self) {
        match self.session.start() {
            Ok(effects) => {
                self.apply(effects).await;
            }
            Err(err) => warn!("GATT server not started: {}", err),
        }

        while !self.session.is_destroyed() {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(GattServerRequest::Send { device, text, reply }) => {
                        self.send(device, text, reply).await;
                    }
                    Some(GattServerRequest::Stop) | None => {
                        let effects = self.session.stop();
                        self.apply(effects).await;
                    }
                },
                Some(tagged) = self.events.recv() => {
                    let effects = self.session.handle_event(tagged.generation, tagged.event);
                    self.apply(effects).await;
                }
                Some(_) = self.timers.recv() => {}
            }
        }

        self.io.cancel_timers();
        info!("GATT server driver stopped");
    }

    async fn send(&mut self, device: PeerAddress, text: String, reply: Option<oneshot::Sender<bool>>) {
        let accepted = match self.session.send_to_peer(&device, &text) {
            Ok(effects) => self.apply(effects).await,
            Err(err) => {
                debug!("Send to {} rejected: {}", device, err);
                false
            }
        };
        match reply {
            Some(reply) => {
                let _ = reply.send(accepted);
            }
            None => {
                let _ = self.notices.send(SessionNotice::ServerSent {
                    device,
                    text,
                    accepted,
                });
            }
        }
    }

    /// Returns whether the radio accepted every command
    async fn apply(&mut self, effects: Vec<Effect<GattServerCommand, GattServerNotice>>) -> bool {
        let applied = self.io.apply(self.session.generation(), effects).await;
        for notice in applied.notices {
            let _ = self.notices.send(SessionNotice::Server(notice));
        }
        applied.radio_ok
    }
}

pub(crate) fn spawn(
    link: GattServerLink,
    lease: Lease,
    config: &SessionConfig,
    notices: NoticeSender,
) -> (GattServerHandle, JoinHandle<()>) {
    let (request_tx, requests) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (timer_tx, timers) = mpsc::unbounded_channel();

    let driver = GattServerDriver {
        session: GattServer::new(config.max_message_bytes),
        io: SessionIo::new(ServiceKind::GattServer, link, events_tx, timer_tx, failure_event),
        requests,
        events,
        timers,
        notices: notices.clone(),
        _lease: lease,
    };
    let task = spawn_supervised(ServiceKind::GattServer, driver.run(), notices);
    (GattServerHandle { tx: request_tx }, task)
}
