//! This example scans for two seconds and prints every bridge event.

use blebridge::{Bridge, BridgeConfig, BridgeEvent, BtleplugStack};
use futures::StreamExt;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let bridge = Bridge::start(BtleplugStack::new().await?, BridgeConfig::default());

    // Create a stream that is provided with bridge events
    let mut event_stream = bridge.event_stream();

    // Read events in a separate task
    let join_handle = tokio::spawn(async move {
        while let Some(event) = event_stream.next().await {
            match event {
                BridgeEvent::StateChanged {
                    manager,
                    powered_on,
                    message,
                } => println!("Manager {} powered on: {} ({})", manager, powered_on, message),
                BridgeEvent::PeripheralDiscovered { record, .. } => println!(
                    "Device discovered: {} {:?} rssi={}",
                    record.peer_id, record.local_name, record.rssi
                ),
                other => println!("{:?}", other),
            }
        }
    });

    let manager = bridge.allocate_manager().await?;
    bridge.scan(manager, true).await?;

    sleep(Duration::from_millis(2000)).await;

    bridge.stop_scan(manager).await?;
    bridge.shutdown().await;

    join_handle.await?;

    Ok(())
}
