mod common;

use common::*;
use futures_util::StreamExt;
use pdubridge::{Config, EntityKey, EntityValue, Manager, PduError, PlatformEvent};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine_config() -> Config {
    let mut config = Config::default();
    config.server.enabled = false;
    config
}

async fn next_event<S>(events: &mut S) -> PlatformEvent
where
    S: futures_util::Stream<Item = PlatformEvent> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("event within timeout")
        .expect("stream open")
}

#[tokio::test]
async fn command_for_unknown_device_changes_nothing() {
    let manager = Manager::start(engine_config()).await.unwrap();
    let mut rx = manager.subscribe();

    assert!(matches!(
        manager.set_outlet("nope", 1, true).await,
        Err(PduError::DeviceUnreachable(_))
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert!(manager.devices().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn polled_pdu_flows_to_platform_events() {
    let server = MockServer::start().await;
    mount_healthy_pdu(&server).await;
    Mock::given(method("POST"))
        .and(path("/outlet.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("success"))
        .expect(1)
        .mount(&server)
        .await;

    let mut pdu = client_config(&server);
    pdu.poll_interval_secs = 3600;
    pdu.show_outlet_power = true;
    let id = pdu.device_id();

    let mut config = engine_config();
    config.changsui.push(pdu);

    let manager = Manager::start(config).await.unwrap();
    let events = manager.events();
    futures_util::pin_mut!(events);

    let mut added = None;
    while added.is_none() {
        if let PlatformEvent::DeviceAdded { device_id, entities, .. } = next_event(&mut events).await {
            assert_eq!(device_id, id);
            added = Some(entities);
        }
    }
    // The admission event is followed by the first snapshot, already
    // filtered through the per-outlet options of this PDU
    let (mut saw_voltage, mut saw_outlet_power) = (false, false);
    while !(saw_voltage && saw_outlet_power) {
        if let PlatformEvent::EntityUpdate { entity, value, .. } = next_event(&mut events).await {
            match entity {
                EntityKey::Voltage => {
                    assert_eq!(value, EntityValue::Number(220.1));
                    saw_voltage = true;
                }
                EntityKey::OutletPower(2) => {
                    assert_eq!(value, EntityValue::Number(10.0));
                    saw_outlet_power = true;
                }
                EntityKey::OutletCurrent(_) => panic!("outlet current is not enabled"),
                _ => {}
            }
        }
    }

    let entities = manager.entities(&id).unwrap();
    assert!(entities.contains(&(EntityKey::Switch(1), EntityValue::Bool(true))));
    assert!(entities.contains(&(EntityKey::OutletPower(2), EntityValue::Number(10.0))));
    assert!(!entities.iter().any(|(k, _)| matches!(k, EntityKey::OutletCurrent(_))));

    manager.set_outlet(&id, 2, true).await.unwrap();
    loop {
        if let PlatformEvent::EntityUpdate { entity, value, .. } = next_event(&mut events).await {
            if entity == EntityKey::Switch(2) {
                assert_eq!(value, EntityValue::Bool(true));
                break;
            }
        }
    }

    let diagnostics = manager.diagnostics(&id).unwrap();
    assert!(diagnostics.available);
    assert!(diagnostics.has_telemetry);
    assert_eq!(diagnostics.poll_interval_secs, Some(3600));
    let session = diagnostics.session.unwrap();
    assert!(session.logged_in);
    assert_eq!(session.consecutive_failures, 0);

    assert!(manager.remove_device(&id));
    loop {
        if let PlatformEvent::DeviceRemoved { device_id } = next_event(&mut events).await {
            assert_eq!(device_id, id);
            break;
        }
    }
    assert!(manager.device(&id).is_none());
    assert!(!manager.remove_device(&id));

    manager.shutdown().await;
    assert!(manager.is_shutdown());
}

#[tokio::test]
async fn duplicate_changsui_is_rejected() {
    let server = MockServer::start().await;
    let mut pdu = client_config(&server);
    pdu.poll_interval_secs = 3600;

    let manager = Manager::start(engine_config()).await.unwrap();
    manager.add_changsui(pdu.clone()).unwrap();
    assert!(matches!(
        manager.add_changsui(pdu),
        Err(PduError::DuplicateDevice(_))
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn runtime_entries_are_validated() {
    let server = MockServer::start().await;
    let manager = Manager::start(engine_config()).await.unwrap();

    let zero_interval = pdubridge::ChangsuiConfig {
        poll_interval_secs: 0,
        ..client_config(&server)
    };
    assert!(matches!(
        manager.add_changsui(zero_interval),
        Err(PduError::Config(_))
    ));

    let odd_outlets = pdubridge::ChangsuiConfig {
        outlets: 12,
        ..client_config(&server)
    };
    assert!(matches!(
        manager.add_changsui(odd_outlets),
        Err(PduError::Config(_))
    ));

    // Nothing was scheduled, so a valid entry for the same host still goes in
    let mut good = client_config(&server);
    good.poll_interval_secs = 3600;
    manager.add_changsui(good).unwrap();

    manager.shutdown().await;
    assert!(manager.devices().is_empty());
}
