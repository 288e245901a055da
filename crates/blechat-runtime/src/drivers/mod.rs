//! Per-session drivers
//!
//! Each session runs in its own task. The task owns the state machine, its
//! radio link, its timers and its lease, and serializes three inputs: requests
//! from the handle, tagged radio events and expired timers.

pub mod advertiser;
pub mod gatt_client;
pub mod gatt_server;
pub mod scanner;

use std::fmt::Debug;
use std::future::Future;

use blechat_core::{
    session::{AdvertiserNotice, GattClientNotice, GattServerNotice, ScannerNotice},
    Effect, Generation, PeerAddress, ServiceKind, TimerToken,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::radio::{EventSink, RadioLink, Tagged};
use crate::timers::TimerSet;

pub use advertiser::AdvertiserHandle;
pub use gatt_client::GattClientHandle;
pub use gatt_server::GattServerHandle;
pub use scanner::ScannerHandle;

/// Everything a driver reports to the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Advertiser(AdvertiserNotice),
    Scanner(ScannerNotice),
    Server(GattServerNotice),
    /// Outcome of a server-side send
    ServerSent {
        device: PeerAddress,
        text: String,
        accepted: bool,
    },
    Client(GattClientNotice),
    /// The driver task ended without a destroyed signal
    Lost(ServiceKind),
}

pub type NoticeSender = mpsc::UnboundedSender<SessionNotice>;

// ----------------------------------------------------------------------------
// Effect Execution
// ----------------------------------------------------------------------------

/// Result of applying one batch of effects
pub(crate) struct Applied<N> {
    pub notices: Vec<N>,
    /// Every radio command was accepted by the platform
    pub radio_ok: bool,
}

/// The I/O half of a driver
pub(crate) struct SessionIo<C, E> {
    kind: ServiceKind,
    link: Box<dyn RadioLink<Command = C, Event = E>>,
    events_tx: mpsc::UnboundedSender<Tagged<E>>,
    timers: TimerSet,
    /// Event standing in for the radio's answer when a command is refused
    failure_event: fn(&C) -> Option<E>,
}

impl<C, E> SessionIo<C, E>
where
    C: Debug + Send + 'static,
    E: Send + 'static,
{
    pub fn new(
        kind: ServiceKind,
        link: Box<dyn RadioLink<Command = C, Event = E>>,
        events_tx: mpsc::UnboundedSender<Tagged<E>>,
        timer_tx: mpsc::UnboundedSender<TimerToken>,
        failure_event: fn(&C) -> Option<E>,
    ) -> Self {
        Self {
            kind,
            link,
            events_tx,
            timers: TimerSet::new(timer_tx),
            failure_event,
        }
    }

    /// Execute `effects` in order; radio commands are tagged with `generation`
    /// unless the effect names its own
    pub async fn apply<N>(
        &mut self,
        generation: Generation,
        effects: Vec<Effect<C, N>>,
    ) -> Applied<N> {
        let mut notices = Vec::new();
        let mut radio_ok = true;

        for effect in effects {
            match effect {
                Effect::Radio(command) => radio_ok &= self.execute(generation, command).await,
                Effect::RadioFor {
                    command,
                    generation: attempt,
                } => radio_ok &= self.execute(attempt, command).await,
                Effect::StartTimer { timer, after } => self.timers.start(timer, after),
                Effect::CancelTimer(kind) => self.timers.cancel(kind),
                Effect::Notify(notice) => notices.push(notice),
            }
        }

        Applied { notices, radio_ok }
    }

    /// Returns whether the platform accepted `command`
    async fn execute(&mut self, generation: Generation, command: C) -> bool {
        debug!("{} radio command ({}): {:?}", self.kind, generation, command);
        let failure = (self.failure_event)(&command);
        let sink = EventSink::new(generation, self.events_tx.clone());
        match self.link.execute(command, sink.clone()).await {
            Ok(()) => true,
            Err(err) => {
                warn!("{} radio command refused: {}", self.kind, err);
                if let Some(event) = failure {
                    sink.emit(event);
                }
                false
            }
        }
    }

    pub fn cancel_timers(&mut self) {
        self.timers.cancel_all();
    }
}

/// Run a driver and report a panic as a lost session
pub(crate) fn spawn_supervised<F>(kind: ServiceKind, driver: F, notices: NoticeSender) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(driver);
    tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!("{} driver finished", kind),
            Err(err) if err.is_panic() => {
                error!("{} driver panicked", kind);
                let _ = notices.send(SessionNotice::Lost(kind));
            }
            Err(_) => {
                warn!("{} driver cancelled", kind);
                let _ = notices.send(SessionNotice::Lost(kind));
            }
        }
    })
}
