//! Radio facade
//!
//! [`RadioAdapter`] hands out one [`RadioLink`] per session. A link executes
//! the session's radio commands; results come back later through the
//! [`EventSink`] given with each command, tagged with the generation that was
//! current when the command was issued.

use std::sync::Arc;

use async_trait::async_trait;
use blechat_core::{
    orchestrator::Capabilities,
    session::{
        AdvertiserCommand, AdvertiserEvent, GattClientCommand, GattClientEvent,
        GattServerCommand, GattServerEvent, ScannerCommand, ScannerEvent,
    },
    Generation, ServiceKind,
};
use dashmap::DashSet;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RadioError;

// ----------------------------------------------------------------------------
// Event Sink
// ----------------------------------------------------------------------------

/// A radio event together with the generation it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged<E> {
    pub generation: Generation,
    pub event: E,
}

/// Where a link delivers the results of one command
#[derive(Debug)]
pub struct EventSink<E> {
    generation: Generation,
    tx: mpsc::UnboundedSender<Tagged<E>>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<Tagged<E>>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Deliver `event`. Returns false once the session has gone away.
    pub fn emit(&self, event: E) -> bool {
        self.tx
            .send(Tagged {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Links and Adapter
// ----------------------------------------------------------------------------

/// Executes the radio commands of a single session
#[async_trait]
pub trait RadioLink: Send {
    type Command: Send + 'static;
    type Event: Send + 'static;

    /// Issue `command`. An `Ok` only means the platform accepted the call.
    async fn execute(
        &mut self,
        command: Self::Command,
        sink: EventSink<Self::Event>,
    ) -> Result<(), RadioError>;
}

pub type AdvertiserLink = Box<dyn RadioLink<Command = AdvertiserCommand, Event = AdvertiserEvent>>;
pub type ScannerLink = Box<dyn RadioLink<Command = ScannerCommand, Event = ScannerEvent>>;
pub type GattServerLink = Box<dyn RadioLink<Command = GattServerCommand, Event = GattServerEvent>>;
pub type GattClientLink = Box<dyn RadioLink<Command = GattClientCommand, Event = GattClientEvent>>;

/// Thin accessor over the platform radio; holds no session state
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    async fn capabilities(&self) -> Result<Capabilities, RadioError>;
    async fn advertiser(&self) -> Result<AdvertiserLink, RadioError>;
    async fn scanner(&self) -> Result<ScannerLink, RadioError>;
    async fn gatt_server(&self) -> Result<GattServerLink, RadioError>;
    async fn gatt_client(&self) -> Result<GattClientLink, RadioError>;
}

// ----------------------------------------------------------------------------
// Handle Leases
// ----------------------------------------------------------------------------

/// Exclusive ownership of the radio handle for each service kind
#[derive(Debug, Clone, Default)]
pub struct RadioLeases {
    held: Arc<DashSet<ServiceKind>>,
}

impl RadioLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, kind: ServiceKind) -> Result<Lease, RadioError> {
        if !self.held.insert(kind) {
            return Err(RadioError::HandleBusy(kind));
        }
        debug!("Lease taken for {}", kind);
        Ok(Lease {
            kind,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, kind: ServiceKind) -> bool {
        self.held.contains(&kind)
    }
}

/// Returned to the pool on drop
#[derive(Debug)]
pub struct Lease {
    kind: ServiceKind,
    held: Arc<DashSet<ServiceKind>>,
}

impl Lease {
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.held.remove(&self.kind);
        debug!("Lease released for {}", self.kind);
    }
}
