mod common;

use std::time::Duration;

use blebridge::common::properties;
use blebridge::native::NativeEvent;
use blebridge::{
    Bridge, BridgeConfig, BridgeError, BridgeEvent, ManagerId, ManagerInfo, STATUS_CANCELLED,
    STATUS_OK,
};
use common::{advertisement, characteristic, peer, uuid16, Call, FakeStack, Harness};
use futures::StreamExt;

#[tokio::test]
async fn managers_get_distinct_stable_ids() {
    let h = Harness::new();

    let first = h.bridge.allocate_manager().await.unwrap();
    let second = h.bridge.allocate_manager().await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.bridge.managers().await, Ok(vec![first, second]));
    assert_eq!(
        h.bridge.manager_info(first).await,
        Ok(ManagerInfo {
            id: first,
            powered_on: false,
            scanning: false,
            peers: Vec::new(),
        })
    );

    h.bridge.destroy_manager(first).await.unwrap();
    let third = h.bridge.allocate_manager().await.unwrap();

    assert_ne!(third, first);
    assert_eq!(h.bridge.managers().await, Ok(vec![second, third]));
}

#[tokio::test]
async fn unknown_manager_is_rejected() {
    let h = Harness::new();
    let bogus = ManagerId::from_raw(77);

    assert_eq!(h.bridge.scan(bogus, false).await, Err(BridgeError::UnknownManager(bogus)));
    assert_eq!(
        h.bridge.connect(bogus, &peer(1).to_string()).await,
        Err(BridgeError::UnknownManager(bogus))
    );
    assert_eq!(
        h.bridge.destroy_manager(bogus).await,
        Err(BridgeError::UnknownManager(bogus))
    );
}

#[tokio::test]
async fn scan_without_duplicates_reports_each_peer_once() {
    let h = Harness::new();
    let manager = h.bridge.allocate_manager().await.unwrap();

    h.bridge.scan(manager, false).await.unwrap();
    h.post(manager, advertisement(peer(1), -50));
    h.post(manager, advertisement(peer(2), -70));
    h.post_and_settle(manager, advertisement(peer(1), -48)).await;

    let discovered: Vec<_> = h.events().iter().filter_map(|e| e.peer()).collect();
    assert_eq!(discovered, vec![peer(1), peer(2)]);
    assert_eq!(h.calls(), vec![Call::Scan(false)]);
}

#[tokio::test]
async fn restarted_scan_reports_peers_again() {
    let h = Harness::new();
    let manager = h.bridge.allocate_manager().await.unwrap();

    h.bridge.scan(manager, false).await.unwrap();
    h.post_and_settle(manager, advertisement(peer(1), -50)).await;
    h.bridge.stop_scan(manager).await.unwrap();
    h.bridge.scan(manager, false).await.unwrap();
    h.post_and_settle(manager, advertisement(peer(1), -50)).await;

    assert_eq!(h.events().len(), 2);
    assert_eq!(h.calls(), vec![Call::Scan(false), Call::StopScan, Call::Scan(false)]);
}

#[tokio::test]
async fn scan_with_duplicates_reports_every_advertisement() {
    let h = Harness::new();
    let manager = h.bridge.allocate_manager().await.unwrap();

    h.bridge.scan(manager, true).await.unwrap();
    h.post(manager, advertisement(peer(1), -50));
    h.post_and_settle(manager, advertisement(peer(1), -49)).await;

    assert_eq!(h.events().len(), 2);
}

#[tokio::test]
async fn advertisements_outside_a_scan_are_dropped() {
    let h = Harness::new();
    let manager = h.bridge.allocate_manager().await.unwrap();

    h.post_and_settle(manager, advertisement(peer(1), -50)).await;

    assert!(h.events().is_empty());
}

#[tokio::test]
async fn scanning_twice_is_rejected_and_stop_is_idempotent() {
    let h = Harness::new();
    let manager = h.bridge.allocate_manager().await.unwrap();

    h.bridge.scan(manager, false).await.unwrap();
    assert_eq!(h.bridge.scan(manager, true).await, Err(BridgeError::AlreadyScanning));
    assert_eq!(h.bridge.is_scanning(manager).await, Ok(true));

    h.bridge.stop_scan(manager).await.unwrap();
    h.bridge.stop_scan(manager).await.unwrap();

    assert_eq!(h.bridge.is_scanning(manager).await, Ok(false));
    assert_eq!(h.calls(), vec![Call::Scan(false), Call::StopScan]);
}

#[tokio::test]
async fn power_state_is_reported_per_manager() {
    let h = Harness::new();
    let first = h.bridge.allocate_manager().await.unwrap();
    let second = h.bridge.allocate_manager().await.unwrap();

    h.bridge.scan(second, false).await.unwrap();
    h.post(
        first,
        NativeEvent::StateChanged {
            powered_on: true,
            message: "on".into(),
        },
    );
    h.post_and_settle(
        second,
        NativeEvent::StateChanged {
            powered_on: false,
            message: "off".into(),
        },
    )
    .await;

    assert_eq!(
        h.events(),
        vec![
            BridgeEvent::StateChanged {
                manager: first,
                powered_on: true,
                message: "on".into()
            },
            BridgeEvent::StateChanged {
                manager: second,
                powered_on: false,
                message: "off".into()
            },
        ]
    );
    assert!(h.bridge.manager_info(first).await.unwrap().powered_on);
    assert_eq!(h.bridge.is_scanning(second).await, Ok(false));
}

#[tokio::test]
async fn advertisements_refresh_last_rssi_of_known_peers() {
    let h = Harness::new();
    let p = peer(1);
    let manager = h.connected(p).await;

    h.post_and_settle(manager, advertisement(p, -42)).await;

    assert_eq!(h.bridge.last_rssi(manager, &p.to_string()).await, Ok(Some(-42)));
}

#[tokio::test]
async fn sessions_are_scoped_to_their_manager() {
    let h = Harness::new();
    let p = peer(1);
    let first = h.connected(p).await;
    let second = h.bridge.allocate_manager().await.unwrap();

    assert_eq!(
        h.bridge.peripheral(second, &p.to_string()).await,
        Err(BridgeError::UnknownPeer(p))
    );
    assert_eq!(h.bridge.manager_info(first).await.unwrap().peers, vec![p]);
}

#[tokio::test]
async fn destroying_a_manager_tears_down_its_sessions() {
    let h = Harness::new();
    let p = peer(1);
    let manager = h.connected(p).await;
    let (_, chrs) = h
        .with_characteristics(manager, p, vec![characteristic(10, 0x2A19, properties::READ)])
        .await;

    h.bridge.scan(manager, false).await.unwrap();
    h.bridge
        .read_characteristic(manager, &p.to_string(), chrs[0])
        .await
        .unwrap();
    h.bridge.destroy_manager(manager).await.unwrap();

    assert_eq!(
        h.calls(),
        vec![
            Call::Scan(false),
            Call::ReadCharacteristic(p, 10),
            Call::StopScan,
            Call::CancelConnection(p),
            Call::Close,
        ]
    );
    assert_eq!(
        h.events(),
        vec![
            BridgeEvent::CharacteristicRead {
                manager,
                peer: p,
                status: STATUS_CANCELLED,
                uuid: uuid16(0x2A19),
                value: Vec::new()
            },
            BridgeEvent::PeripheralDisconnected {
                manager,
                peer: p,
                reason: STATUS_CANCELLED
            },
        ]
    );

    // Completions still in flight for the destroyed manager go nowhere.
    h.post_and_settle(manager, NativeEvent::Disconnected { peer: p, reason: 0 })
        .await;
    assert_eq!(h.events().len(), 2);
    assert_eq!(
        h.bridge.connect(manager, &p.to_string()).await,
        Err(BridgeError::UnknownManager(manager))
    );
}

#[tokio::test]
async fn shutdown_destroys_every_manager() {
    let h = Harness::new();
    let p = peer(1);
    h.connected(p).await;
    let stack = h.stack.clone();

    h.bridge.shutdown().await;

    let calls = stack.state().calls.clone();
    assert_eq!(calls, vec![Call::CancelConnection(p), Call::Close]);
}

#[tokio::test]
async fn event_streams_receive_dispatched_events() {
    let stack = FakeStack::default();
    let bridge = Bridge::start(stack.clone(), BridgeConfig::default());
    let mut events = bridge.event_stream();

    let manager = bridge.allocate_manager().await.unwrap();
    let native = stack.state().events.get(&manager).cloned().unwrap();
    native.post(NativeEvent::StateChanged {
        powered_on: true,
        message: "ready".into(),
    });

    let event = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap();

    assert_eq!(
        event,
        Some(BridgeEvent::StateChanged {
            manager,
            powered_on: true,
            message: "ready".into()
        })
    );
}

#[tokio::test]
async fn event_streams_end_when_the_bridge_is_dropped() {
    let bridge = Bridge::start(FakeStack::default(), BridgeConfig::default());
    let mut events = bridge.event_stream();

    drop(bridge);

    let next = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap();
    assert_eq!(next, None);
}

#[tokio::test]
async fn requests_after_shutdown_fail_closed() {
    let stack = FakeStack::default();
    let bridge = Bridge::start(stack.clone(), BridgeConfig::default());
    let manager = bridge.allocate_manager().await.unwrap();
    let native = stack.state().events.get(&manager).cloned().unwrap();

    bridge.shutdown().await;

    assert!(!native.post(NativeEvent::Connected {
        peer: peer(1),
        status: STATUS_OK
    }));
}

#[test]
fn rejection_codes_are_negative() {
    let err = BridgeError::AlreadyScanning;

    assert_eq!(blebridge::status_code::<()>(&Err(err)), -6);
}
