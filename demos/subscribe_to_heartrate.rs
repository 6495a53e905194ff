//! This example connects to the first device advertising the heart rate
//! service and prints heart rate measurements as they arrive.

use blebridge::common::characteristics::HEART_RATE_MEASUREMENT;
use blebridge::common::services::HEART_RATE;
use blebridge::{
    Bridge, BridgeConfig, BtleplugStack, ByteView, EventHandler, ManagerId, PeerId,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Steps of the demo, fed back to `main` from the bridge's callbacks.
#[derive(Debug)]
enum Step {
    Found(PeerId),
    Connected(PeerId),
    Service(PeerId, blebridge::AttrId),
    Measurement(blebridge::AttrId),
}

struct HeartRateHandler {
    steps: mpsc::UnboundedSender<Step>,
}

impl EventHandler for HeartRateHandler {
    fn on_peripheral_discovered(&mut self, _manager: ManagerId, record: &blebridge::DiscoveredPeripheral) {
        if record.service_uuids.contains(&HEART_RATE) {
            self.steps.send(Step::Found(record.peer_id)).ok();
        }
    }

    fn on_peripheral_connected(&mut self, _manager: ManagerId, peer: &PeerId, status: i32) {
        if status == 0 {
            self.steps.send(Step::Connected(*peer)).ok();
        }
    }

    fn on_services_discovered(
        &mut self,
        _manager: ManagerId,
        peer: &PeerId,
        _status: i32,
        services: &[blebridge::Service],
    ) {
        for service in services {
            println!("Service: {:?}", service);
            self.steps.send(Step::Service(*peer, service.id)).ok();
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        _manager: ManagerId,
        _peer: &PeerId,
        _status: i32,
        characteristics: &[blebridge::Characteristic],
    ) {
        for characteristic in characteristics {
            if characteristic.uuid == HEART_RATE_MEASUREMENT {
                self.steps.send(Step::Measurement(characteristic.id)).ok();
            }
        }
    }

    fn on_characteristic_read(
        &mut self,
        _manager: ManagerId,
        _peer: &PeerId,
        _status: i32,
        uuid: &Uuid,
        value: ByteView<'_>,
    ) {
        if *uuid == HEART_RATE_MEASUREMENT {
            println!("{:?}", value.as_slice());
        }
    }

    fn on_rssi_read(&mut self, _manager: ManagerId, _peer: &PeerId, _status: i32, rssi: i16) {
        println!("RSSI: {}", rssi);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let (steps, mut next_step) = mpsc::unbounded_channel();
    let bridge = Bridge::with_handler(
        BtleplugStack::new().await?,
        BridgeConfig::default(),
        HeartRateHandler { steps },
    );

    let manager = bridge.allocate_manager().await?;
    bridge.scan(manager, false).await?;

    let mut device = None;

    while let Some(step) = next_step.recv().await {
        match step {
            Step::Found(peer) if device.is_none() => {
                bridge.stop_scan(manager).await?;
                bridge.connect(manager, &peer.to_string()).await?;
                device = Some(peer);
            }
            Step::Found(_) => {}
            Step::Connected(peer) => {
                bridge
                    .discover_services(manager, &peer.to_string(), &[HEART_RATE])
                    .await?;
            }
            Step::Service(peer, service) => {
                bridge
                    .discover_characteristics(manager, &peer.to_string(), service, &[HEART_RATE_MEASUREMENT])
                    .await?;
            }
            Step::Measurement(characteristic) => {
                if let Some(peer) = device {
                    bridge.subscribe(manager, &peer.to_string(), characteristic).await?;
                    bridge.read_rssi(manager, &peer.to_string()).await?;
                }
            }
        }
    }

    Ok(())
}
