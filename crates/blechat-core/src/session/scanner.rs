//! Scanner session and the discovered-peer registry

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::effects::{Effect, TimerKind, TimerToken};
use crate::errors::SessionError;
use crate::session::StateChange;
use crate::types::{DiscoveredPeer, Generation, PeerAddress, ServiceState};

// ----------------------------------------------------------------------------
// Modes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    /// Report every advertiser in range
    Unfiltered,
    /// Only report advertisers of the chat service
    ServiceFiltered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    /// Run until stopped
    Continuous,
    /// Stop on its own after the scan window
    Interval,
}

// ----------------------------------------------------------------------------
// Commands, Events, Notices
// ----------------------------------------------------------------------------

/// A single advertisement sighting as delivered by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub address: PeerAddress,
    pub rssi: i16,
    pub service_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerCommand {
    StartScan { filter: FilterMode },
    StopScan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    Result(ScanReport),
    BatchResults(Vec<ScanReport>),
    ScanFailed { code: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerNotice {
    StateChanged(StateChange),
    /// Whether a scan is currently running
    StatusChanged(bool),
    PeerDiscovered(DiscoveredPeer),
    /// A batch sighting refreshed the signal strength of a known peer
    PeerUpdated(DiscoveredPeer),
    Destroyed,
}

pub type ScannerEffect = Effect<ScannerCommand, ScannerNotice>;

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

/// Discovered peers, deduplicated by address, in discovery order
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Vec<DiscoveredPeer>,
    rssi_threshold: Option<i16>,
}

impl PeerRegistry {
    /// `rssi_threshold` of `None` disables signal filtering
    pub fn new(rssi_threshold: Option<i16>) -> Self {
        Self {
            peers: Vec::new(),
            rssi_threshold,
        }
    }

    pub fn peers(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    pub fn get(&self, index: usize) -> Option<&DiscoveredPeer> {
        self.peers.get(index)
    }

    pub fn find(&self, address: &PeerAddress) -> Option<&DiscoveredPeer> {
        self.peers.iter().find(|peer| &peer.address == address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn set_rssi_threshold(&mut self, threshold: Option<i16>) {
        self.rssi_threshold = threshold;
    }

    pub fn reset(&mut self) {
        self.peers.clear();
    }

    fn passes_filter(&self, report: &ScanReport) -> bool {
        self.rssi_threshold
            .map_or(true, |threshold| report.rssi >= threshold)
    }

    /// Single-result path: new addresses are added, repeats are ignored
    pub fn observe(&mut self, report: ScanReport) -> Option<DiscoveredPeer> {
        if self.find(&report.address).is_some() || !self.passes_filter(&report) {
            return None;
        }
        let peer = DiscoveredPeer {
            address: report.address,
            rssi: report.rssi,
            service_data: report.service_data,
        };
        self.peers.push(peer.clone());
        Some(peer)
    }

    /// Batch path: every unseen address that passes the filter is added and
    /// known addresses get their signal strength refreshed
    ///
    /// A filtered entry only skips itself, the rest of the batch is still
    /// processed. Returns `(discovered, updated)`.
    pub fn observe_batch(
        &mut self,
        reports: Vec<ScanReport>,
    ) -> (Vec<DiscoveredPeer>, Vec<DiscoveredPeer>) {
        let mut discovered = Vec::new();
        let mut updated = Vec::new();
        for report in reports {
            if let Some(known) = self.peers.iter_mut().find(|p| p.address == report.address) {
                if known.rssi != report.rssi {
                    known.rssi = report.rssi;
                    updated.push(known.clone());
                }
                continue;
            }
            if let Some(peer) = self.observe(report) {
                discovered.push(peer);
            }
        }
        (discovered, updated)
    }
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Scanner {
    state: ServiceState,
    generation: Generation,
    scan_window: Duration,
    rssi_threshold: i16,
    /// Filter and mode of the scan in progress
    active: Option<(FilterMode, ScanMode)>,
    registry: PeerRegistry,
    destroyed: bool,
}

impl Scanner {
    pub fn new(scan_window: Duration, rssi_threshold: i16, rssi_filter_enabled: bool) -> Self {
        Self {
            state: ServiceState::Idle,
            generation: Generation::INITIAL,
            scan_window,
            rssi_threshold,
            active: None,
            registry: PeerRegistry::new(rssi_filter_enabled.then_some(rssi_threshold)),
            destroyed: false,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.scan_window,
            config.rssi_threshold,
            config.rssi_filter_enabled,
        )
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_mode(&self) -> Option<(FilterMode, ScanMode)> {
        self.active
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Acquire the scanner. There is no radio round trip, so the session
    /// goes straight through `Starting` to `Running`.
    pub fn open(&mut self) -> Vec<ScannerEffect> {
        if self.state != ServiceState::Idle || self.destroyed {
            return Vec::new();
        }
        let mut effects = self.enter(ServiceState::Starting);
        effects.extend(self.enter(ServiceState::Running));
        effects
    }

    pub fn start(
        &mut self,
        filter: FilterMode,
        mode: ScanMode,
    ) -> Result<Vec<ScannerEffect>, SessionError> {
        if self.state != ServiceState::Running || self.destroyed {
            return Err(SessionError::InvalidState {
                operation: "start scanning",
                state: self.state,
            });
        }

        let mut effects = Vec::new();
        match self.active {
            Some(active) if active == (filter, mode) => {
                debug!("Scan already running with {:?}/{:?}", filter, mode);
                return Ok(effects);
            }
            Some(_) => {
                debug!("Restarting scan with {:?}/{:?}", filter, mode);
                effects.extend(self.stop());
            }
            None => {}
        }

        let generation = self.generation.bump();
        self.active = Some((filter, mode));
        info!("Scanning ({:?}, {:?})", filter, mode);
        effects.push(Effect::Radio(ScannerCommand::StartScan { filter }));
        effects.push(Effect::Notify(ScannerNotice::StatusChanged(true)));
        if mode == ScanMode::Interval {
            effects.push(Effect::start_timer(
                TimerKind::ScanWindow,
                generation,
                self.scan_window,
            ));
        }
        Ok(effects)
    }

    /// Stop the current scan; does nothing when not scanning
    pub fn stop(&mut self) -> Vec<ScannerEffect> {
        if self.active.take().is_none() {
            return Vec::new();
        }
        self.generation.bump();
        vec![
            Effect::CancelTimer(TimerKind::ScanWindow),
            Effect::Radio(ScannerCommand::StopScan),
            Effect::Notify(ScannerNotice::StatusChanged(false)),
        ]
    }

    pub fn set_rssi_filter(&mut self, enabled: bool) {
        let threshold = enabled.then_some(self.rssi_threshold);
        self.registry.set_rssi_threshold(threshold);
    }

    pub fn reset(&mut self) {
        self.registry.reset();
    }

    pub fn handle_event(&mut self, generation: Generation, event: ScannerEvent) -> Vec<ScannerEffect> {
        if self.destroyed || generation != self.generation || self.active.is_none() {
            debug!("Dropping stale scan event ({})", generation);
            return Vec::new();
        }

        match event {
            ScannerEvent::Result(report) => self
                .registry
                .observe(report)
                .map(|peer| vec![Effect::Notify(ScannerNotice::PeerDiscovered(peer))])
                .unwrap_or_default(),
            ScannerEvent::BatchResults(reports) => {
                let (discovered, updated) = self.registry.observe_batch(reports);
                discovered
                    .into_iter()
                    .map(|peer| Effect::Notify(ScannerNotice::PeerDiscovered(peer)))
                    .chain(
                        updated
                            .into_iter()
                            .map(|peer| Effect::Notify(ScannerNotice::PeerUpdated(peer))),
                    )
                    .collect()
            }
            ScannerEvent::ScanFailed { code } => {
                warn!("Scan failed with code {}", code);
                self.active = None;
                self.generation.bump();
                vec![
                    Effect::CancelTimer(TimerKind::ScanWindow),
                    Effect::Notify(ScannerNotice::StatusChanged(false)),
                ]
            }
        }
    }

    pub fn handle_timer(&mut self, timer: TimerToken) -> Vec<ScannerEffect> {
        if self.destroyed || timer.generation != self.generation {
            return Vec::new();
        }
        match timer.kind {
            TimerKind::ScanWindow => {
                debug!("Scan window elapsed");
                self.stop()
            }
            _ => Vec::new(),
        }
    }

    /// Tear the session down. Safe to call repeatedly.
    pub fn close(&mut self) -> Vec<ScannerEffect> {
        if self.destroyed {
            return Vec::new();
        }
        let mut effects = self.stop();
        self.destroyed = true;
        self.generation.bump();
        effects.extend(self.enter(ServiceState::Stopping));
        effects.extend(self.enter(ServiceState::Stopped));
        effects.push(Effect::Notify(ScannerNotice::Destroyed));
        effects
    }

    fn enter(&mut self, state: ServiceState) -> Vec<ScannerEffect> {
        self.state = state;
        vec![Effect::Notify(ScannerNotice::StateChanged(StateChange::new(
            state,
        )))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(address: &str, rssi: i16) -> ScanReport {
        ScanReport {
            address: PeerAddress::new(address),
            rssi,
            service_data: Vec::new(),
        }
    }

    fn running_scanner() -> Scanner {
        let mut scanner = Scanner::new(Duration::from_secs(5), -60, true);
        scanner.open();
        scanner
    }

    #[test]
    fn test_single_results_dedup_by_address() {
        let mut registry = PeerRegistry::new(None);
        assert!(registry.observe(report("A", -40)).is_some());
        assert!(registry.observe(report("A", -30)).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.peers()[0].rssi, -40);
    }

    #[test]
    fn test_batch_skips_filtered_entry_and_continues() {
        let mut registry = PeerRegistry::new(Some(-60));
        let (discovered, _) = registry.observe_batch(vec![
            report("A", -50),
            report("WEAK", -80),
            report("B", -55),
        ]);
        let addresses: Vec<_> = discovered.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(addresses, vec!["A", "B"]);
    }

    #[test]
    fn test_batch_refreshes_signal_strength() {
        let mut registry = PeerRegistry::new(None);
        registry.observe(report("A", -70));
        let (discovered, updated) = registry.observe_batch(vec![report("A", -45)]);
        assert!(discovered.is_empty());
        assert_eq!(updated.len(), 1);
        assert_eq!(registry.find(&PeerAddress::new("A")).unwrap().rssi, -45);
    }

    #[test]
    fn test_interval_scan_arms_window_and_auto_stops() {
        let mut scanner = running_scanner();
        let effects = scanner
            .start(FilterMode::ServiceFiltered, ScanMode::Interval)
            .unwrap();
        let timer = effects
            .iter()
            .find_map(|e| match e {
                Effect::StartTimer { timer, after } => Some((*timer, *after)),
                _ => None,
            })
            .unwrap();
        assert_eq!(timer.1, Duration::from_secs(5));

        let effects = scanner.handle_timer(timer.0);
        assert!(effects.contains(&Effect::Radio(ScannerCommand::StopScan)));
        assert!(effects.contains(&Effect::Notify(ScannerNotice::StatusChanged(false))));
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn test_same_mode_start_is_noop() {
        let mut scanner = running_scanner();
        scanner
            .start(FilterMode::Unfiltered, ScanMode::Continuous)
            .unwrap();
        let effects = scanner
            .start(FilterMode::Unfiltered, ScanMode::Continuous)
            .unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn test_mode_switch_stops_before_restarting() {
        let mut scanner = running_scanner();
        scanner
            .start(FilterMode::Unfiltered, ScanMode::Continuous)
            .unwrap();
        let effects = scanner
            .start(FilterMode::Unfiltered, ScanMode::Interval)
            .unwrap();
        let radio: Vec<_> = effects.iter().filter_map(Effect::radio).collect();
        assert_eq!(
            radio,
            vec![
                &ScannerCommand::StopScan,
                &ScannerCommand::StartScan {
                    filter: FilterMode::Unfiltered
                }
            ]
        );
    }

    #[test]
    fn test_old_window_timer_cannot_stop_new_scan() {
        let mut scanner = running_scanner();
        let first = scanner
            .start(FilterMode::Unfiltered, ScanMode::Interval)
            .unwrap();
        let old_token = first
            .iter()
            .find_map(|e| match e {
                Effect::StartTimer { timer, .. } => Some(*timer),
                _ => None,
            })
            .unwrap();
        scanner.stop();
        scanner
            .start(FilterMode::Unfiltered, ScanMode::Continuous)
            .unwrap();

        assert!(scanner.handle_timer(old_token).is_empty());
        assert!(scanner.is_scanning());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut scanner = running_scanner();
        assert!(scanner.stop().is_empty());
    }

    #[test]
    fn test_results_after_stop_are_dropped() {
        let mut scanner = running_scanner();
        scanner
            .start(FilterMode::Unfiltered, ScanMode::Continuous)
            .unwrap();
        let generation = scanner.generation();
        scanner.stop();
        let effects = scanner.handle_event(generation, ScannerEvent::Result(report("A", -40)));
        assert!(effects.is_empty());
        assert!(scanner.registry().is_empty());
    }

    #[test]
    fn test_close_emits_single_destroyed() {
        let mut scanner = running_scanner();
        scanner
            .start(FilterMode::Unfiltered, ScanMode::Continuous)
            .unwrap();
        let effects = scanner.close();
        assert!(effects.contains(&Effect::Radio(ScannerCommand::StopScan)));
        assert_eq!(
            effects.last(),
            Some(&Effect::Notify(ScannerNotice::Destroyed))
        );
        assert!(scanner.close().is_empty());
    }
}
