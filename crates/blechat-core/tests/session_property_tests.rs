//! Property-based tests for payload bounds, peer deduplication, retry
//! accounting and generation gating

use std::collections::HashSet;

use blechat_core::{
    protocol::{DiscoveredService, ServiceDefinition},
    session::{
        gatt_client::GattClientEffect, Advertiser, GattClient, GattClientEvent, GattServer,
        LinkState, PeerRegistry, ScanReport,
    },
    Effect, Generation, PeerAddress, RadioStatus, ServiceState, SessionConfig, SessionError,
    TimerKind, TimerToken, INBOUND_CHARACTERISTIC_UUID, MAX_MESSAGE_BYTES,
    OUTBOUND_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use proptest::prelude::*;

fn arb_report() -> impl Strategy<Value = ScanReport> {
    (0u8..8, -100i16..-20, prop::collection::vec(any::<u8>(), 0..8)).prop_map(
        |(address, rssi, service_data)| ScanReport {
            address: PeerAddress::new(format!("00:00:00:00:00:{:02X}", address)),
            rssi,
            service_data,
        },
    )
}

fn drop_link(client: &mut GattClient) -> Vec<GattClientEffect> {
    client.handle_event(
        client.generation(),
        GattClientEvent::ConnectionStateChanged {
            status: RadioStatus(8),
            link: LinkState::Disconnected,
        },
    )
}

fn chat_service() -> Vec<DiscoveredService> {
    let definition = ServiceDefinition::chat();
    vec![DiscoveredService {
        uuid: definition.uuid,
        characteristics: definition.characteristics.iter().map(|c| c.uuid).collect(),
    }]
}

proptest! {
    /// Property: advertising succeeds iff the payload is strictly shorter than the limit
    #[test]
    fn advertise_bound(len in 0usize..64, max in 1usize..64) {
        let mut advertiser = Advertiser::new();
        let result = advertiser.start(vec![0xAB; len], max);
        if len < max {
            let effects = result.unwrap();
            prop_assert!(effects.iter().any(|e| e.radio().is_some()));
        } else {
            let is_too_large = matches!(result, Err(SessionError::PayloadTooLarge { .. }));
            prop_assert!(is_too_large);
            prop_assert_eq!(advertiser.state(), ServiceState::Idle);
        }
    }

    /// Property: sends are rejected locally iff the UTF-8 encoding exceeds the cap,
    /// whatever the session state
    #[test]
    fn message_bound(text in "[a-zé€]{0,160}") {
        let too_large = text.len() > MAX_MESSAGE_BYTES;

        let mut client = GattClient::new(SessionConfig::default());
        let client_result = client.send_text(&text);
        prop_assert_eq!(
            matches!(client_result, Err(SessionError::PayloadTooLarge { .. })),
            too_large
        );

        let mut server = GattServer::new(MAX_MESSAGE_BYTES);
        let server_result = server.send_to_peer(&PeerAddress::new("P"), &text);
        prop_assert_eq!(
            matches!(server_result, Err(SessionError::PayloadTooLarge { .. })),
            too_large
        );
    }

    /// Property: the registry never holds two peers with the same address, and
    /// every peer it holds passed the signal filter when first seen
    #[test]
    fn registry_dedup(
        singles in prop::collection::vec(arb_report(), 0..20),
        batch in prop::collection::vec(arb_report(), 0..20),
    ) {
        let mut registry = PeerRegistry::new(Some(-60));
        for report in singles {
            registry.observe(report);
        }
        registry.observe_batch(batch.clone());

        let addresses: HashSet<_> = registry.peers().iter().map(|p| p.address.clone()).collect();
        prop_assert_eq!(addresses.len(), registry.len());

        // Every passing, unseen batch entry was added even after a filtered one
        for report in batch.iter().filter(|r| r.rssi >= -60) {
            prop_assert!(registry.find(&report.address).is_some());
        }
    }

    /// Property: StartFailed is reached exactly when one more retry than the
    /// budget would be needed, and no reconnect beyond the budget is issued
    #[test]
    fn retry_accounting(max_retries in 0u32..8, drops in 0u32..12) {
        let config = SessionConfig::default().with_max_retries(max_retries);
        let mut client = GattClient::new(config);
        let mut effects = client.connect(PeerAddress::new("P")).unwrap();

        for _ in 0..drops {
            effects.extend(drop_link(&mut client));
            let generation = client.generation();
            effects.extend(client.handle_timer(TimerToken::new(TimerKind::RetryBackoff, generation)));
        }

        let reconnects = effects
            .iter()
            .filter(|e| matches!(e.radio(), Some(blechat_core::session::GattClientCommand::Reconnect)))
            .count() as u32;
        prop_assert_eq!(reconnects, drops.min(max_retries));
        prop_assert_eq!(client.state() == ServiceState::StartFailed, drops > max_retries);
        prop_assert!(client.retry_attempts() <= max_retries);
    }

    /// Property: events tagged with any generation but the current one never
    /// change the session
    #[test]
    fn stale_generations_are_inert(offsets in prop::collection::vec(1u64..5, 1..10)) {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(PeerAddress::new("P")).unwrap();
        drop_link(&mut client);
        let current = client.generation();
        let before = (client.state(), client.retry_attempts());

        for offset in offsets {
            let stale = Generation::new(current.value().saturating_sub(offset));
            let effects = client.handle_event(
                stale,
                GattClientEvent::ConnectionStateChanged {
                    status: RadioStatus::SUCCESS,
                    link: LinkState::Connected,
                },
            );
            prop_assert!(effects.is_empty());
            let timer = client.handle_timer(TimerToken::new(TimerKind::ConnectionTimeout, stale));
            prop_assert!(timer.is_empty());
        }
        prop_assert_eq!((client.state(), client.retry_attempts()), before);
    }

    /// Property: repeated teardown yields one destroyed signal and one close
    #[test]
    fn teardown_once(calls in 1usize..5, reach_running in any::<bool>()) {
        let mut client = GattClient::new(SessionConfig::default());
        client.connect(PeerAddress::new("P")).unwrap();
        if reach_running {
            let generation = client.generation();
            client.handle_event(generation, GattClientEvent::ConnectionStateChanged {
                status: RadioStatus::SUCCESS,
                link: LinkState::Connected,
            });
            client.handle_event(generation, GattClientEvent::MtuChanged { mtu: 512, status: RadioStatus::SUCCESS });
            client.handle_event(generation, GattClientEvent::ServicesDiscovered {
                status: RadioStatus::SUCCESS,
                services: chat_service(),
            });
            client.handle_timer(TimerToken::new(TimerKind::SettleDelay, generation));
            client.handle_event(generation, GattClientEvent::CharacteristicWrite { status: RadioStatus::SUCCESS });
            prop_assert_eq!(client.state(), ServiceState::Running);
        }

        let mut effects = Vec::new();
        for _ in 0..calls {
            effects.extend(client.disconnect());
        }
        let destroyed = effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify(blechat_core::session::GattClientNotice::Destroyed)))
            .count();
        let closes = effects
            .iter()
            .filter(|e| matches!(e.radio(), Some(blechat_core::session::GattClientCommand::Close)))
            .count();
        prop_assert_eq!(destroyed, 1);
        prop_assert_eq!(closes, 1);
    }
}

#[test]
fn chat_service_definition_matches_discovery_uuids() {
    let services = chat_service();
    assert_eq!(services[0].uuid, SERVICE_UUID);
    assert!(services[0].characteristics.contains(&INBOUND_CHARACTERISTIC_UUID));
    assert!(services[0].characteristics.contains(&OUTBOUND_CHARACTERISTIC_UUID));
}
