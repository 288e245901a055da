//! Central role over btleplug: the scanner and GATT client links
//!
//! Both links answer asynchronously. Long operations (connect, discovery,
//! writes) run on spawned tasks that report through the sink of the command
//! that started them, so a late answer carries its original generation.
//! Unsolicited events (disconnects, notifications) go to the sink of the most
//! recent command.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use blechat_core::{
    protocol::DiscoveredService,
    session::{
        FilterMode, GattClientCommand, GattClientEvent, LinkState, ScanReport, ScannerCommand,
        ScannerEvent,
    },
    PeerAddress, RadioStatus, SERVICE_UUID,
};
use blechat_runtime::{EventSink, RadioError, RadioLink};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BleError, Result};

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

// ----------------------------------------------------------------------------
// Scan Reports
// ----------------------------------------------------------------------------

/// Build a report from advertised properties, or `None` when `filter`
/// excludes the device or no signal strength was measured
pub(crate) fn scan_report(
    address: String,
    rssi: Option<i16>,
    services: &[Uuid],
    service_data: &HashMap<Uuid, Vec<u8>>,
    filter: FilterMode,
) -> Option<ScanReport> {
    // Some platforms ignore the scan filter, so it is applied again here
    let advertises_chat =
        services.contains(&SERVICE_UUID) || service_data.contains_key(&SERVICE_UUID);
    if filter == FilterMode::ServiceFiltered && !advertises_chat {
        return None;
    }
    Some(ScanReport {
        address: PeerAddress::new(address),
        rssi: rssi?,
        service_data: service_data.get(&SERVICE_UUID).cloned().unwrap_or_default(),
    })
}

async fn report_for(adapter: &Adapter, id: &PeripheralId, filter: FilterMode) -> Option<ScanReport> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    scan_report(
        properties.address.to_string(),
        properties.rssi,
        &properties.services,
        &properties.service_data,
        filter,
    )
}

async fn pump_scan_events(
    adapter: Adapter,
    mut events: CentralEvents,
    filter: FilterMode,
    sink: EventSink<ScannerEvent>,
) {
    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => id,
            _ => continue,
        };
        let Some(report) = report_for(&adapter, &id, filter).await else {
            continue;
        };
        if !sink.emit(ScannerEvent::Result(report)) {
            break;
        }
    }
    debug!("Scan event stream ended");
}

// ----------------------------------------------------------------------------
// Scanner Link
// ----------------------------------------------------------------------------

pub struct BleScannerLink {
    adapter: Adapter,
    pump: Option<JoinHandle<()>>,
}

impl BleScannerLink {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            pump: None,
        }
    }

    async fn start(&mut self, filter: FilterMode, sink: EventSink<ScannerEvent>) -> Result<()> {
        self.stop_pump();
        let events = self.adapter.events().await?;
        let scan_filter = match filter {
            FilterMode::ServiceFiltered => ScanFilter {
                services: vec![SERVICE_UUID],
            },
            FilterMode::Unfiltered => ScanFilter::default(),
        };
        self.adapter.start_scan(scan_filter).await?;
        self.pump = Some(tokio::spawn(pump_scan_events(
            self.adapter.clone(),
            events,
            filter,
            sink,
        )));
        info!("BLE scan started ({:?})", filter);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop_pump();
        self.adapter.stop_scan().await?;
        info!("BLE scan stopped");
        Ok(())
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for BleScannerLink {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[async_trait]
impl RadioLink for BleScannerLink {
    type Command = ScannerCommand;
    type Event = ScannerEvent;

    async fn execute(
        &mut self,
        command: ScannerCommand,
        sink: EventSink<ScannerEvent>,
    ) -> std::result::Result<(), RadioError> {
        match command {
            ScannerCommand::StartScan { filter } => self.start(filter, sink).await?,
            ScannerCommand::StopScan => self.stop().await?,
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// GATT Client Link
// ----------------------------------------------------------------------------

type LatestSink = watch::Receiver<Option<EventSink<GattClientEvent>>>;

fn emit_latest(latest: &LatestSink, event: GattClientEvent) -> bool {
    latest
        .borrow()
        .as_ref()
        .map_or(false, |sink| sink.emit(event))
}

/// Connection control, the part of a peripheral a closing link needs
#[async_trait]
trait LinkControl: Send + Sync {
    async fn link_up(&self) -> btleplug::Result<bool>;
    async fn drop_link(&self) -> btleplug::Result<()>;
}

#[async_trait]
impl LinkControl for Peripheral {
    async fn link_up(&self) -> btleplug::Result<bool> {
        self.is_connected().await
    }

    async fn drop_link(&self) -> btleplug::Result<()> {
        btleplug::api::Peripheral::disconnect(self).await
    }
}

/// Disconnect `link` if it is up, marking the drop as ours so the watcher
/// stays quiet
async fn release_link(link: &impl LinkControl, expect_disconnect: &AtomicBool) -> Result<()> {
    expect_disconnect.store(true, Ordering::SeqCst);
    if link.link_up().await? {
        link.drop_link().await?;
    }
    Ok(())
}

pub struct BleClientLink {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    latest: watch::Sender<Option<EventSink<GattClientEvent>>>,
    /// Set while a disconnect we asked for is outstanding
    expect_disconnect: Arc<AtomicBool>,
    watcher: Option<(PeripheralId, JoinHandle<()>)>,
    notifications: Option<JoinHandle<()>>,
    operations: Vec<JoinHandle<()>>,
}

impl BleClientLink {
    pub fn new(adapter: Adapter) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            adapter,
            peripheral: None,
            latest,
            expect_disconnect: Arc::new(AtomicBool::new(false)),
            watcher: None,
            notifications: None,
            operations: Vec::new(),
        }
    }

    fn peripheral(&self) -> Result<&Peripheral> {
        self.peripheral.as_ref().ok_or(BleError::NoPeer)
    }

    async fn find(&self, peer: &PeerAddress) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string() == peer.as_str() {
                return Ok(peripheral);
            }
        }
        Err(BleError::PeerNotFound {
            address: peer.as_str().to_string(),
        })
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or(BleError::CharacteristicNotFound { uuid })
    }

    fn spawn(&mut self, operation: impl std::future::Future<Output = ()> + Send + 'static) {
        self.operations.retain(|task| !task.is_finished());
        self.operations.push(tokio::spawn(operation));
    }

    /// Watch the adapter for the peer dropping the link
    async fn watch_disconnects(&mut self, peripheral: &Peripheral) -> Result<()> {
        let id = peripheral.id();
        if matches!(&self.watcher, Some((watched, _)) if *watched == id) {
            return Ok(());
        }
        if let Some((_, task)) = self.watcher.take() {
            task.abort();
        }

        let mut events = self.adapter.events().await?;
        let latest = self.latest.subscribe();
        let expected = Arc::clone(&self.expect_disconnect);
        let watched = id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDisconnected(gone) = event else {
                    continue;
                };
                if gone != watched {
                    continue;
                }
                if expected.swap(false, Ordering::SeqCst) {
                    debug!("Requested disconnect completed");
                    continue;
                }
                info!("Peer dropped the connection");
                let event = GattClientEvent::ConnectionStateChanged {
                    status: RadioStatus::SUCCESS,
                    link: LinkState::Disconnected,
                };
                if !emit_latest(&latest, event) {
                    break;
                }
            }
        });
        self.watcher = Some((id, task));
        Ok(())
    }

    fn connect(&mut self, peripheral: Peripheral, sink: EventSink<GattClientEvent>) {
        self.expect_disconnect.store(false, Ordering::SeqCst);
        self.spawn(async move {
            let status = match peripheral.connect().await {
                Ok(()) => RadioStatus::SUCCESS,
                Err(err) => {
                    warn!("BLE connect failed: {}", err);
                    RadioStatus::FAILURE
                }
            };
            let link = if status.is_success() {
                LinkState::Connected
            } else {
                LinkState::Disconnected
            };
            sink.emit(GattClientEvent::ConnectionStateChanged { status, link });
        });
    }

    fn discover_services(&mut self, sink: EventSink<GattClientEvent>) -> Result<()> {
        let peripheral = self.peripheral()?.clone();
        self.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => GattClientEvent::ServicesDiscovered {
                    status: RadioStatus::SUCCESS,
                    services: peripheral
                        .services()
                        .into_iter()
                        .map(|service| DiscoveredService {
                            uuid: service.uuid,
                            characteristics: service
                                .characteristics
                                .iter()
                                .map(|characteristic| characteristic.uuid)
                                .collect(),
                        })
                        .collect(),
                },
                Err(err) => {
                    warn!("Service discovery failed: {}", err);
                    GattClientEvent::ServicesDiscovered {
                        status: RadioStatus::FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            sink.emit(event);
        });
        Ok(())
    }

    fn write(&mut self, uuid: Uuid, value: Vec<u8>, sink: EventSink<GattClientEvent>) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        let peripheral = self.peripheral()?.clone();
        self.spawn(async move {
            let result = peripheral
                .write(&characteristic, &value, WriteType::WithResponse)
                .await;
            if let Err(err) = &result {
                warn!("Characteristic write failed: {}", err);
            }
            sink.emit(GattClientEvent::CharacteristicWrite {
                status: result.is_ok().into(),
            });
        });
        Ok(())
    }

    async fn set_notifications(&mut self, uuid: Uuid, enabled: bool) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        let peripheral = self.peripheral()?.clone();
        if !enabled {
            if let Some(task) = self.notifications.take() {
                task.abort();
            }
            peripheral.unsubscribe(&characteristic).await?;
            return Ok(());
        }

        peripheral.subscribe(&characteristic).await?;
        if self.notifications.is_none() {
            let mut stream = peripheral.notifications().await?;
            let latest = self.latest.subscribe();
            self.notifications = Some(tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    let event = GattClientEvent::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    };
                    if !emit_latest(&latest, event) {
                        break;
                    }
                }
                debug!("Notification stream ended");
            }));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        release_link(self.peripheral()?, &self.expect_disconnect).await
    }

    /// Release the handle. btleplug keeps the link up after the handle is
    /// dropped, so a connected peer is disconnected first.
    async fn close(&mut self) -> Result<()> {
        self.stop_tasks();
        match self.peripheral.take() {
            Some(peripheral) => release_link(&peripheral, &self.expect_disconnect).await,
            None => Ok(()),
        }
    }

    fn stop_tasks(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
        if let Some((_, task)) = self.watcher.take() {
            task.abort();
        }
        for task in self.operations.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BleClientLink {
    fn drop(&mut self) {
        self.stop_tasks();
        let Some(peripheral) = self.peripheral.take() else {
            return;
        };
        let expected = Arc::clone(&self.expect_disconnect);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = release_link(&peripheral, &expected).await {
                        warn!("Could not release BLE link: {}", err);
                    }
                });
            }
            Err(_) => warn!("BLE link dropped outside the runtime, leaving it up"),
        }
    }
}

#[async_trait]
impl RadioLink for BleClientLink {
    type Command = GattClientCommand;
    type Event = GattClientEvent;

    async fn execute(
        &mut self,
        command: GattClientCommand,
        sink: EventSink<GattClientEvent>,
    ) -> std::result::Result<(), RadioError> {
        self.latest.send_replace(Some(sink.clone()));
        match command {
            GattClientCommand::Connect { peer } => {
                let peripheral = self.find(&peer).await?;
                self.watch_disconnects(&peripheral).await?;
                self.peripheral = Some(peripheral.clone());
                self.connect(peripheral, sink);
            }
            GattClientCommand::Reconnect => {
                let peripheral = self.peripheral()?.clone();
                self.connect(peripheral, sink);
            }
            // Never answered; see `watch_disconnects`
            GattClientCommand::Disconnect => self.disconnect().await?,
            GattClientCommand::Close => self.close().await?,
            GattClientCommand::RequestMtu(mtu) => {
                // btleplug negotiates the MTU on connect and does not expose it
                debug!("MTU {} requested, keeping the platform's", mtu);
                sink.emit(GattClientEvent::MtuChanged {
                    mtu,
                    status: RadioStatus::SUCCESS,
                });
            }
            GattClientCommand::DiscoverServices => self.discover_services(sink)?,
            GattClientCommand::WriteCharacteristic {
                characteristic,
                value,
            } => self.write(characteristic, value, sink)?,
            GattClientCommand::SetNotifications {
                characteristic,
                enabled,
            } => self.set_notifications(characteristic, enabled).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeLink {
        connected: AtomicBool,
        drops: AtomicUsize,
    }

    #[async_trait]
    impl LinkControl for FakeLink {
        async fn link_up(&self) -> btleplug::Result<bool> {
            Ok(self.connected.load(Ordering::SeqCst))
        }

        async fn drop_link(&self) -> btleplug::Result<()> {
            self.drops.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn chat_service_data() -> HashMap<Uuid, Vec<u8>> {
        HashMap::from([(SERVICE_UUID, b"blechat".to_vec())])
    }

    #[test]
    fn test_report_carries_chat_service_data() {
        let report = scan_report(
            "AA:BB:CC:DD:EE:FF".to_string(),
            Some(-48),
            &[SERVICE_UUID],
            &chat_service_data(),
            FilterMode::ServiceFiltered,
        )
        .expect("chat peer is reported");
        assert_eq!(report.address, PeerAddress::new("AA:BB:CC:DD:EE:FF"));
        assert_eq!(report.rssi, -48);
        assert_eq!(report.service_data, b"blechat".to_vec());
    }

    #[test]
    fn test_filtered_scan_skips_other_devices() {
        let other = Uuid::from_u128(0x180D);
        let report = scan_report(
            "11:22:33:44:55:66".to_string(),
            Some(-40),
            &[other],
            &HashMap::new(),
            FilterMode::ServiceFiltered,
        );
        assert!(report.is_none());

        let report = scan_report(
            "11:22:33:44:55:66".to_string(),
            Some(-40),
            &[other],
            &HashMap::new(),
            FilterMode::Unfiltered,
        )
        .expect("unfiltered scan reports everything");
        assert!(report.service_data.is_empty());
    }

    #[test]
    fn test_sighting_without_rssi_is_skipped() {
        let report = scan_report(
            "AA:BB:CC:DD:EE:FF".to_string(),
            None,
            &[SERVICE_UUID],
            &chat_service_data(),
            FilterMode::Unfiltered,
        );
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn test_release_disconnects_a_live_link_quietly() {
        let link = FakeLink::default();
        link.connected.store(true, Ordering::SeqCst);
        let expect_disconnect = AtomicBool::new(false);

        release_link(&link, &expect_disconnect).await.unwrap();
        assert_eq!(link.drops.load(Ordering::SeqCst), 1);
        assert!(!link.connected.load(Ordering::SeqCst));
        assert!(expect_disconnect.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_release_leaves_a_dead_link_alone() {
        let link = FakeLink::default();
        let expect_disconnect = AtomicBool::new(false);

        release_link(&link, &expect_disconnect).await.unwrap();
        assert_eq!(link.drops.load(Ordering::SeqCst), 0);
    }
}
