//! This example connects to the first device advertising the battery service
//! and reads its battery level.

use blebridge::common::characteristics::BATTERY_LEVEL;
use blebridge::common::services::BATTERY;
use blebridge::{Bridge, BridgeConfig, BridgeEvent, BtleplugStack, STATUS_OK};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let bridge = Bridge::start(BtleplugStack::new().await?, BridgeConfig::default());
    let mut events = bridge.event_stream();

    let manager = bridge.allocate_manager().await?;
    bridge.scan(manager, false).await?;

    while let Some(event) = events.next().await {
        match event {
            BridgeEvent::PeripheralDiscovered { record, .. }
                if record.service_uuids.contains(&BATTERY) =>
            {
                println!("Found {} ({:?})", record.peer_id, record.local_name);
                bridge.stop_scan(manager).await?;
                bridge.connect(manager, &record.peer_id.to_string()).await?;
            }
            BridgeEvent::PeripheralConnected { peer, status, .. } if status == STATUS_OK => {
                bridge
                    .discover_services(manager, &peer.to_string(), &[BATTERY])
                    .await?;
            }
            BridgeEvent::ServicesDiscovered { peer, services, .. } => {
                for service in services {
                    bridge
                        .discover_characteristics(manager, &peer.to_string(), service.id, &[BATTERY_LEVEL])
                        .await?;
                }
            }
            BridgeEvent::CharacteristicsDiscovered {
                peer,
                characteristics,
                ..
            } => {
                for characteristic in characteristics {
                    bridge
                        .read_characteristic(manager, &peer.to_string(), characteristic.id)
                        .await?;
                }
            }
            BridgeEvent::CharacteristicRead { uuid, value, status, .. } if uuid == BATTERY_LEVEL => {
                println!("Battery level: {:?} (status {})", value, status);
                break;
            }
            BridgeEvent::PeripheralConnected { peer, status, .. } => {
                println!("Could not connect to {}: {}", peer, status);
                break;
            }
            _ => {}
        }
    }

    bridge.shutdown().await;

    Ok(())
}
