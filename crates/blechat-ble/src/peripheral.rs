//! Peripheral role over BlueZ: the advertiser and GATT server links
//!
//! BlueZ answers GATT writes and reads itself when the application callback
//! returns, so the server link reports writes with `response_needed: false`
//! and serves reads from the value it last notified.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blechat_core::{
    protocol::{
        AdvertisementData, AdvertisingInterval, AdvertisingParameters, ServiceDefinition, TxPower,
    },
    session::{AdvertiserCommand, AdvertiserEvent, GattServerCommand, GattServerEvent},
    PeerAddress, RadioStatus,
};
use blechat_runtime::{EventSink, RadioError, RadioLink};
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, Service,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// Advertisement Mapping
// ----------------------------------------------------------------------------

pub(crate) fn interval_of(interval: AdvertisingInterval) -> Duration {
    match interval {
        AdvertisingInterval::Low => Duration::from_millis(100),
        AdvertisingInterval::Medium => Duration::from_millis(250),
        AdvertisingInterval::High => Duration::from_millis(1000),
    }
}

/// Requested transmit power in dBm
pub(crate) fn tx_power_dbm(power: TxPower) -> i16 {
    match power {
        TxPower::UltraLow => -21,
        TxPower::Low => -15,
        TxPower::Medium => -7,
        TxPower::High => 1,
    }
}

/// BlueZ picks legacy vs. extended PDUs and the PHYs on its own
pub(crate) fn advertisement(
    parameters: &AdvertisingParameters,
    data: &AdvertisementData,
    device_name: &str,
) -> Advertisement {
    let interval = interval_of(parameters.interval);
    Advertisement {
        advertisement_type: if parameters.connectable {
            AdvertisementType::Peripheral
        } else {
            AdvertisementType::Broadcast
        },
        service_uuids: BTreeSet::from([data.service_uuid]),
        service_data: BTreeMap::from([(data.service_uuid, data.service_data.clone())]),
        local_name: data
            .include_device_name
            .then(|| device_name.to_string()),
        discoverable: Some(true),
        min_interval: Some(interval),
        max_interval: Some(interval),
        tx_power: Some(tx_power_dbm(parameters.tx_power)),
        ..Default::default()
    }
}

// ----------------------------------------------------------------------------
// Advertiser Link
// ----------------------------------------------------------------------------

pub struct BlueZAdvertiserLink {
    adapter: bluer::Adapter,
    device_name: String,
    parameters: AdvertisingParameters,
    /// Dropping the handle stops advertising
    handle: Option<AdvertisementHandle>,
}

impl BlueZAdvertiserLink {
    pub fn new(adapter: bluer::Adapter, device_name: String) -> Self {
        Self {
            adapter,
            device_name,
            parameters: AdvertisingParameters::default(),
            handle: None,
        }
    }

    async fn advertise(&mut self, data: &AdvertisementData) -> Result<()> {
        self.handle = None;
        let advertisement = advertisement(&self.parameters, data, &self.device_name);
        self.handle = Some(self.adapter.advertise(advertisement).await?);
        info!(
            "Advertising as '{}' with {} bytes of service data",
            self.device_name,
            data.service_data.len()
        );
        Ok(())
    }
}

#[async_trait]
impl RadioLink for BlueZAdvertiserLink {
    type Command = AdvertiserCommand;
    type Event = AdvertiserEvent;

    async fn execute(
        &mut self,
        command: AdvertiserCommand,
        sink: EventSink<AdvertiserEvent>,
    ) -> std::result::Result<(), RadioError> {
        match command {
            AdvertiserCommand::StartAdvertisingSet { parameters, data } => {
                self.parameters = parameters;
                self.advertise(&data).await?;
                sink.emit(AdvertiserEvent::SetStarted {
                    status: RadioStatus::SUCCESS,
                });
            }
            AdvertiserCommand::SetAdvertisingData(data) => {
                // BlueZ cannot update a registered advertisement in place
                if self.handle.is_some() {
                    self.advertise(&data).await?;
                }
            }
            AdvertiserCommand::StopAdvertisingSet => {
                if self.handle.take().is_some() {
                    info!("Stopped advertising");
                }
                sink.emit(AdvertiserEvent::SetStopped);
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// GATT Server Link
// ----------------------------------------------------------------------------

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

type LatestSink = watch::Receiver<Option<EventSink<GattServerEvent>>>;

fn emit_latest(latest: &LatestSink, event: GattServerEvent) -> bool {
    latest
        .borrow()
        .as_ref()
        .map_or(false, |sink| sink.emit(event))
}

struct Notification {
    value: Vec<u8>,
    sent: oneshot::Sender<bool>,
}

/// State shared with the callbacks of the registered application
struct ServerShared {
    latest: LatestSink,
    request_ids: AtomicU32,
    /// Last device that wrote to us; BlueZ does not name the subscriber
    last_writer: Mutex<Option<PeerAddress>>,
    /// Served to reads of the outbound characteristic
    outbound_value: Mutex<Vec<u8>>,
    subscribed: AtomicBool,
    notifications: Mutex<mpsc::Receiver<Notification>>,
    /// Bumped by every new subscription so an older one lets go
    subscription: watch::Sender<u64>,
}

impl ServerShared {
    fn new(latest: LatestSink) -> (Self, mpsc::Sender<Notification>) {
        let (notifications, notifications_rx) = mpsc::channel(8);
        let (subscription, _) = watch::channel(0);
        let shared = Self {
            latest,
            request_ids: AtomicU32::new(0),
            last_writer: Mutex::new(None),
            outbound_value: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
            notifications: Mutex::new(notifications_rx),
            subscription,
        };
        (shared, notifications)
    }
}

pub struct BlueZServerLink {
    adapter: bluer::Adapter,
    latest: watch::Sender<Option<EventSink<GattServerEvent>>>,
    shared: Arc<ServerShared>,
    notifications: mpsc::Sender<Notification>,
    application: Option<ApplicationHandle>,
}

impl BlueZServerLink {
    pub fn new(adapter: bluer::Adapter) -> Self {
        let (latest, latest_rx) = watch::channel(None);
        let (shared, notifications) = ServerShared::new(latest_rx);
        Self {
            adapter,
            latest,
            shared: Arc::new(shared),
            notifications,
            application: None,
        }
    }

    async fn add_service(&mut self, definition: &ServiceDefinition) -> Result<()> {
        let characteristics = definition
            .characteristics
            .iter()
            .map(|characteristic| {
                let properties = characteristic.properties;
                Characteristic {
                    uuid: characteristic.uuid,
                    write: properties
                        .write
                        .then(|| write_handler(characteristic.uuid, Arc::clone(&self.shared))),
                    read: properties.read.then(|| read_handler(Arc::clone(&self.shared))),
                    notify: properties
                        .notify
                        .then(|| notify_handler(Arc::clone(&self.shared))),
                    ..Default::default()
                }
            })
            .collect();

        let application = Application {
            services: vec![Service {
                uuid: definition.uuid,
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };
        self.application = Some(self.adapter.serve_gatt_application(application).await?);
        info!("GATT service {} registered", definition.uuid);
        Ok(())
    }

    async fn notify(&mut self, value: Vec<u8>) -> Result<bool> {
        if !self.shared.subscribed.load(Ordering::SeqCst) {
            return Err(BleError::NotSubscribed);
        }
        *self.shared.outbound_value.lock().await = value.clone();
        let (sent, outcome) = oneshot::channel();
        if self
            .notifications
            .send(Notification { value, sent })
            .await
            .is_err()
        {
            return Err(BleError::NotSubscribed);
        }
        // The subscriber may vanish between the check and the send
        match tokio::time::timeout(NOTIFY_TIMEOUT, outcome).await {
            Ok(sent) => Ok(sent.unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }
}

fn write_handler(uuid: uuid::Uuid, shared: Arc<ServerShared>) -> CharacteristicWrite {
    CharacteristicWrite {
        write: true,
        write_without_response: true,
        method: CharacteristicWriteMethod::Fun(Box::new(
            move |value: Vec<u8>, request: CharacteristicWriteRequest| {
                let shared = Arc::clone(&shared);
                Box::pin(async move {
                    let device = PeerAddress::new(request.device_address.to_string());
                    debug!("{} bytes written by {}", value.len(), device);
                    let is_new = {
                        let mut last_writer = shared.last_writer.lock().await;
                        let is_new = last_writer.as_ref() != Some(&device);
                        *last_writer = Some(device.clone());
                        is_new
                    };
                    if is_new {
                        emit_latest(
                            &shared.latest,
                            GattServerEvent::ConnectionStateChanged {
                                device: device.clone(),
                                connected: true,
                            },
                        );
                    }
                    emit_latest(
                        &shared.latest,
                        GattServerEvent::WriteRequest {
                            device,
                            request_id: shared.request_ids.fetch_add(1, Ordering::SeqCst),
                            characteristic: uuid,
                            response_needed: false,
                            value,
                        },
                    );
                    Ok(())
                })
            },
        )),
        ..Default::default()
    }
}

fn read_handler(shared: Arc<ServerShared>) -> CharacteristicRead {
    CharacteristicRead {
        read: true,
        fun: Box::new(move |_request: CharacteristicReadRequest| {
            let shared = Arc::clone(&shared);
            Box::pin(async move { Ok(shared.outbound_value.lock().await.clone()) })
        }),
        ..Default::default()
    }
}

/// BlueZ's side of one notification subscription
#[async_trait]
trait NotifySession: Send {
    async fn send(&mut self, value: Vec<u8>) -> std::io::Result<()>;
    /// Resolves once the central unsubscribes or goes away
    async fn closed(&mut self);
}

#[async_trait]
impl NotifySession for CharacteristicNotifier {
    async fn send(&mut self, value: Vec<u8>) -> std::io::Result<()> {
        self.notify(value).await.map_err(std::io::Error::from)
    }

    async fn closed(&mut self) {
        self.stopped().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionEnd {
    /// The central unsubscribed, dropped, or stopped taking notifications
    Stopped,
    /// A newer subscription took over
    Superseded,
    /// The link was dropped
    Closed,
}

/// Forward queued notifications to `session` until it ends
///
/// Only one subscription holds the queue at a time. A new one bumps the
/// subscription counter, which makes the current holder let go.
async fn serve_subscription(
    shared: &ServerShared,
    session: &mut impl NotifySession,
) -> SubscriptionEnd {
    let mut superseded = shared.subscription.subscribe();
    shared
        .subscription
        .send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    superseded.borrow_and_update();

    let mut notifications = shared.notifications.lock().await;
    shared.subscribed.store(true, Ordering::SeqCst);
    let end = loop {
        tokio::select! {
            _ = session.closed() => break SubscriptionEnd::Stopped,
            _ = superseded.changed() => break SubscriptionEnd::Superseded,
            notification = notifications.recv() => {
                let Some(Notification { value, sent }) = notification else {
                    break SubscriptionEnd::Closed;
                };
                match session.send(value).await {
                    Ok(()) => {
                        let _ = sent.send(true);
                    }
                    Err(err) => {
                        error!("Failed to send notification: {}", err);
                        let _ = sent.send(false);
                        break SubscriptionEnd::Stopped;
                    }
                }
            }
        }
    };
    shared.subscribed.store(false, Ordering::SeqCst);
    end
}

/// A stopped subscription means the central went away; report the device
/// we last heard from as disconnected
async fn report_departure(shared: &ServerShared, end: SubscriptionEnd) -> Option<PeerAddress> {
    if end != SubscriptionEnd::Stopped {
        return None;
    }
    let device = shared.last_writer.lock().await.take()?;
    info!("{} disconnected", device);
    emit_latest(
        &shared.latest,
        GattServerEvent::ConnectionStateChanged {
            device: device.clone(),
            connected: false,
        },
    );
    Some(device)
}

fn notify_handler(shared: Arc<ServerShared>) -> CharacteristicNotify {
    CharacteristicNotify {
        notify: true,
        method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                info!("Central subscribed to notifications");
                let end = serve_subscription(&shared, &mut notifier).await;
                debug!("Notification subscription ended: {:?}", end);
                report_departure(&shared, end).await;
            })
        })),
        ..Default::default()
    }
}

#[async_trait]
impl RadioLink for BlueZServerLink {
    type Command = GattServerCommand;
    type Event = GattServerEvent;

    async fn execute(
        &mut self,
        command: GattServerCommand,
        sink: EventSink<GattServerEvent>,
    ) -> std::result::Result<(), RadioError> {
        self.latest.send_replace(Some(sink.clone()));
        match command {
            GattServerCommand::OpenServer => debug!("GATT server opened"),
            GattServerCommand::AddService(definition) => {
                self.add_service(&definition).await?;
                sink.emit(GattServerEvent::ServiceAdded {
                    status: RadioStatus::SUCCESS,
                });
            }
            GattServerCommand::SendResponse { request_id, .. } => {
                debug!("Request {} already answered by BlueZ", request_id);
            }
            GattServerCommand::NotifyPeer { device, value, .. } => {
                let sent = self.notify(value).await?;
                sink.emit(GattServerEvent::NotificationSent {
                    device,
                    status: sent.into(),
                });
                if !sent {
                    return Err(BleError::NotSubscribed.into());
                }
            }
            GattServerCommand::ClearServices => {
                if self.application.take().is_none() {
                    warn!("No GATT application to clear");
                }
            }
            GattServerCommand::CloseServer => {
                self.application = None;
                *self.shared.last_writer.lock().await = None;
                info!("GATT server closed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blechat_core::{Generation, SERVICE_UUID};
    use blechat_runtime::Tagged;

    /// A subscription that records what it was sent and closes on request
    struct FakeSession {
        sent: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
        closed: Option<oneshot::Receiver<()>>,
    }

    impl FakeSession {
        fn new(closed: Option<oneshot::Receiver<()>>) -> Self {
            Self {
                sent: Arc::default(),
                closed,
            }
        }
    }

    #[async_trait]
    impl NotifySession for FakeSession {
        async fn send(&mut self, value: Vec<u8>) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(value);
            Ok(())
        }

        async fn closed(&mut self) {
            match self.closed.as_mut() {
                Some(closed) => {
                    let _ = closed.await;
                }
                None => std::future::pending().await,
            }
        }
    }

    fn shared_with_sink() -> (
        ServerShared,
        mpsc::Sender<Notification>,
        tokio::sync::mpsc::UnboundedReceiver<Tagged<GattServerEvent>>,
        watch::Sender<Option<EventSink<GattServerEvent>>>,
    ) {
        let (events_tx, events) = tokio::sync::mpsc::unbounded_channel();
        let (latest, latest_rx) = watch::channel(Some(EventSink::new(Generation::INITIAL, events_tx)));
        let (shared, notifications) = ServerShared::new(latest_rx);
        (shared, notifications, events, latest)
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_the_writer_gone() {
        let (shared, _notifications, mut events, _latest) = shared_with_sink();
        *shared.last_writer.lock().await = Some(PeerAddress::new("A"));

        let (stop, closed) = oneshot::channel();
        let mut session = FakeSession::new(Some(closed));
        stop.send(()).unwrap();

        let end = serve_subscription(&shared, &mut session).await;
        assert_eq!(end, SubscriptionEnd::Stopped);
        assert!(!shared.subscribed.load(Ordering::SeqCst));
        assert_eq!(
            report_departure(&shared, end).await,
            Some(PeerAddress::new("A"))
        );
        assert_eq!(
            events.try_recv().unwrap().event,
            GattServerEvent::ConnectionStateChanged {
                device: PeerAddress::new("A"),
                connected: false,
            }
        );
    }

    #[tokio::test]
    async fn test_resubscription_takes_over_without_dropping_the_peer() {
        let (shared, notifications, mut events, _latest) = shared_with_sink();
        let shared = Arc::new(shared);
        *shared.last_writer.lock().await = Some(PeerAddress::new("A"));

        let first = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                let mut session = FakeSession::new(None);
                serve_subscription(&shared, &mut session).await
            }
        });
        while !shared.subscribed.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let session = FakeSession::new(None);
        let delivered = Arc::clone(&session.sent);
        let second = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                let mut session = session;
                serve_subscription(&shared, &mut session).await
            }
        });

        let end = first.await.unwrap();
        assert_eq!(end, SubscriptionEnd::Superseded);
        assert_eq!(report_departure(&shared, end).await, None);
        assert_eq!(
            shared.last_writer.lock().await.clone(),
            Some(PeerAddress::new("A"))
        );
        assert!(events.try_recv().is_err());

        let (sent, outcome) = oneshot::channel();
        notifications
            .send(Notification {
                value: b"hi".to_vec(),
                sent,
            })
            .await
            .unwrap();
        assert!(outcome.await.unwrap());
        assert_eq!(*delivered.lock().unwrap(), vec![b"hi".to_vec()]);

        drop(notifications);
        assert_eq!(second.await.unwrap(), SubscriptionEnd::Closed);
    }

    #[test]
    fn test_advertisement_carries_chat_payload() {
        let data = AdvertisementData::for_chat(b"hi".to_vec());
        let advertisement = advertisement(&AdvertisingParameters::default(), &data, "kitchen");
        assert!(advertisement.service_uuids.contains(&SERVICE_UUID));
        assert_eq!(advertisement.service_data.get(&SERVICE_UUID), Some(&b"hi".to_vec()));
        assert_eq!(advertisement.local_name.as_deref(), Some("kitchen"));
        assert_eq!(advertisement.min_interval, Some(Duration::from_millis(250)));
        assert_eq!(advertisement.tx_power, Some(1));
    }

    #[test]
    fn test_advertisement_without_device_name() {
        let data = AdvertisementData {
            include_device_name: false,
            ..AdvertisementData::for_chat(Vec::new())
        };
        let parameters = AdvertisingParameters {
            connectable: false,
            ..AdvertisingParameters::default()
        };
        let advertisement = advertisement(&parameters, &data, "kitchen");
        assert!(advertisement.local_name.is_none());
        assert!(matches!(
            advertisement.advertisement_type,
            AdvertisementType::Broadcast
        ));
    }

    #[test]
    fn test_power_levels_are_ordered() {
        let levels = [TxPower::UltraLow, TxPower::Low, TxPower::Medium, TxPower::High]
            .map(tx_power_dbm);
        assert!(levels.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
