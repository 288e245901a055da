//! Advertiser driver

use blechat_core::{
    session::{Advertiser, AdvertiserCommand, AdvertiserEvent, AdvertiserNotice},
    Effect, RadioStatus, ServiceKind, TimerToken,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use super::{spawn_supervised, NoticeSender, SessionIo, SessionNotice};
use crate::error::{Result, RuntimeError};
use crate::radio::{AdvertiserLink, Lease, Tagged};

#[derive(Debug)]
pub(crate) enum AdvertiserRequest {
    UpdatePayload(Vec<u8>),
    Stop,
}

#[derive(Debug, Clone)]
pub struct AdvertiserHandle {
    tx: mpsc::UnboundedSender<AdvertiserRequest>,
}

impl AdvertiserHandle {
    pub fn update_payload(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(AdvertiserRequest::UpdatePayload(payload))
            .map_err(|_| RuntimeError::ChannelClosed("advertiser"))
    }

    pub fn stop(&self) -> Result<()> {
        self.tx
            .send(AdvertiserRequest::Stop)
            .map_err(|_| RuntimeError::ChannelClosed("advertiser"))
    }
}

fn failure_event(command: &AdvertiserCommand) -> Option<AdvertiserEvent> {
    match command {
        AdvertiserCommand::StartAdvertisingSet { .. } => Some(AdvertiserEvent::SetStarted {
            status: RadioStatus::FAILURE,
        }),
        _ => None,
    }
}

struct AdvertiserDriver {
    session: Advertiser,
    io: SessionIo<AdvertiserCommand, AdvertiserEvent>,
    requests: mpsc::UnboundedReceiver<AdvertiserRequest>,
    events: mpsc::UnboundedReceiver<Tagged<AdvertiserEvent>>,
    timers: mpsc::UnboundedReceiver<TimerToken>,
    notices: NoticeSender,
    _lease: Lease,
}

impl AdvertiserDriver {
    async fn run(mut self, payload: Vec<u8>, max_advertising_len: usize) {
        match self.session.start(payload, max_advertising_len) {
            Ok(effects) => self.apply(effects).await,
            Err(err) => warn!("Advertisement not started: {}", err),
        }

        while !self.session.is_destroyed() {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(AdvertiserRequest::UpdatePayload(payload)) => {
                        let effects = self.session.update_payload(payload);
                        self.apply(effects).await;
                    }
                    Some(AdvertiserRequest::Stop) | None => {
                        let effects = self.session.stop();
                        self.apply(effects).await;
                    }
                },
                Some(tagged) = self.events.recv() => {
                    let effects = self.session.handle_event(tagged.generation, tagged.event);
                    self.apply(effects).await;
                }
                // The advertiser arms no timers; drain anything stray
                Some(_) = self.timers.recv() => {}
            }
        }

        self.io.cancel_timers();
        info!("Advertiser driver stopped");
    }

    async fn apply(&mut self, effects: Vec<Effect<AdvertiserCommand, AdvertiserNotice>>) {
        let applied = self.io.apply(self.session.generation(), effects).await;
        for notice in applied.notices {
            let _ = self.notices.send(SessionNotice::Advertiser(notice));
        }
    }
}

pub(crate) fn spawn(
    link: AdvertiserLink,
    lease: Lease,
    payload: Vec<u8>,
    max_advertising_len: usize,
    notices: NoticeSender,
) -> (AdvertiserHandle, JoinHandle<()>) {
    let (request_tx, requests) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (timer_tx, timers) = mpsc::unbounded_channel();

    let driver = AdvertiserDriver {
        session: Advertiser::new(),
        io: SessionIo::new(ServiceKind::Advertiser, link, events_tx, timer_tx, failure_event),
        requests,
        events,
        timers,
        notices: notices.clone(),
        _lease: lease,
    };
    let task = spawn_supervised(
        ServiceKind::Advertiser,
        driver.run(payload, max_advertising_len),
        notices,
    );
    (AdvertiserHandle { tx: request_tx }, task)
}
