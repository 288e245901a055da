//! Scanner driver

use blechat_core::{
    session::{FilterMode, ScanMode, Scanner, ScannerCommand, ScannerEvent, ScannerNotice},
    Effect, ServiceKind, SessionConfig, TimerToken,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use super::{spawn_supervised, NoticeSender, SessionIo, SessionNotice};
use crate::error::{Result, RuntimeError};
use crate::radio::{Lease, ScannerLink, Tagged};

#[derive(Debug)]
pub(crate) enum ScannerRequest {
    Start { filter: FilterMode, mode: ScanMode },
    Stop,
    SetRssiFilter(bool),
    Reset,
    Close,
}

#[derive(Debug, Clone)]
pub struct ScannerHandle {
    tx: mpsc::UnboundedSender<ScannerRequest>,
}

impl ScannerHandle {
    fn send(&self, request: ScannerRequest) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| RuntimeError::ChannelClosed("scanner"))
    }

    pub fn start(&self, filter: FilterMode, mode: ScanMode) -> Result<()> {
        self.send(ScannerRequest::Start { filter, mode })
    }

    pub fn stop(&self) -> Result<()> {
        self.send(ScannerRequest::Stop)
    }

    pub fn set_rssi_filter(&self, enabled: bool) -> Result<()> {
        self.send(ScannerRequest::SetRssiFilter(enabled))
    }

    /// Forget every discovered peer
    pub fn reset(&self) -> Result<()> {
        self.send(ScannerRequest::Reset)
    }

    pub fn close(&self) -> Result<()> {
        self.send(ScannerRequest::Close)
    }
}

fn failure_event(command: &ScannerCommand) -> Option<ScannerEvent> {
    match command {
        ScannerCommand::StartScan { .. } => Some(ScannerEvent::ScanFailed { code: -1 }),
        ScannerCommand::StopScan => None,
    }
}

struct ScannerDriver {
    session: Scanner,
    io: SessionIo<ScannerCommand, ScannerEvent>,
    requests: mpsc::UnboundedReceiver<ScannerRequest>,
    events: mpsc::UnboundedReceiver<Tagged<ScannerEvent>>,
    timers: mpsc::UnboundedReceiver<TimerToken>,
    notices: NoticeSender,
    _lease: Lease,
}

impl ScannerDriver {
    async fn run(mut self) {
        let effects = self.session.open();
        self.apply(effects).await;

        while !self.session.is_destroyed() {
            tokio::select! {
                request = self.requests.recv() => {
                    let effects = match request {
                        Some(ScannerRequest::Start { filter, mode }) => {
                            match self.session.start(filter, mode) {
                                Ok(effects) => effects,
                                Err(err) => {
                                    warn!("Scan not started: {}", err);
                                    Vec::new()
                                }
                            }
                        }
                        Some(ScannerRequest::Stop) => self.session.stop(),
                        Some(ScannerRequest::SetRssiFilter(enabled)) => {
                            self.session.set_rssi_filter(enabled);
                            Vec::new()
                        }
                        Some(ScannerRequest::Reset) => {
                            self.session.reset();
                            Vec::new()
                        }
                        Some(ScannerRequest::Close) | None => self.session.close(),
                    };
                    self.apply(effects).await;
                }
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
        info!("Scanner driver stopped");
    }

    async fn apply(&mut self, effects: Vec<Effect<ScannerCommand, ScannerNotice>>) {
        let applied = self.io.apply(self.session.generation(), effects).await;
        for notice in applied.notices {
            let _ = self.notices.send(SessionNotice::Scanner(notice));
        }
    }
}

pub(crate) fn spawn(
    link: ScannerLink,
    lease: Lease,
    config: &SessionConfig,
    notices: NoticeSender,
) -> (ScannerHandle, JoinHandle<()>) {
    let (request_tx, requests) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (timer_tx, timers) = mpsc::unbounded_channel();

    let driver = ScannerDriver {
        session: Scanner::from_config(config),
        io: SessionIo::new(ServiceKind::Scanner, link, events_tx, timer_tx, failure_event),
        requests,
        events,
        timers,
        notices: notices.clone(),
        _lease: lease,
    };
    let task = spawn_supervised(ServiceKind::Scanner, driver.run(), notices);
    (ScannerHandle { tx: request_tx }, task)
}
