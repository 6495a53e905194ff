//! BLE central-role bridge with opaque attribute handles.
//!
//! The bridge owns every central manager, peripheral session and attribute
//! tree behind one execution context. Callers get stable integer ids for the
//! services, characteristics and descriptors the host stack discovers, issue
//! requests that are accepted or rejected immediately, and receive every
//! outcome later as an event, either through an [`EventHandler`] or an
//! [`event stream`](Bridge::event_stream).
//!
//! ## Usage
//!
//! Here is an example on how to connect to the first device found and list
//! its services:
//!
//! ```rust,no_run
//! use blebridge::{Bridge, BridgeConfig, BridgeEvent, BtleplugStack};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     pretty_env_logger::init();
//!
//!     let bridge = Bridge::start(BtleplugStack::new().await?, BridgeConfig::default());
//!     let mut events = bridge.event_stream();
//!
//!     let manager = bridge.allocate_manager().await?;
//!     bridge.scan(manager, false).await?;
//!
//!     while let Some(event) = events.next().await {
//!         match event {
//!             BridgeEvent::PeripheralDiscovered { record, .. } => {
//!                 bridge.stop_scan(manager).await?;
//!                 bridge.connect(manager, &record.peer_id.to_string()).await?;
//!             }
//!             BridgeEvent::PeripheralConnected { peer, status: 0, .. } => {
//!                 bridge.discover_services(manager, &peer.to_string(), &[]).await?;
//!             }
//!             BridgeEvent::ServicesDiscovered { services, .. } => {
//!                 println!("{:?}", services);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use attribute::{Characteristic, Descriptor, Service};
pub use bridge::{Bridge, EventStream};
pub use btle::{BtleplugCentral, BtleplugStack};
pub use buffer::ByteView;
pub use config::BridgeConfig;
pub use error::{status_code, BridgeError, NativeError, Result};
pub use event::{
    BridgeEvent, DiscoveredPeripheral, EventHandler, ServiceData, POWER_LEVEL_UNKNOWN,
    STATUS_CANCELLED, STATUS_OK, STATUS_STALE,
};
pub use manager::{ManagerId, ManagerInfo};
pub use registry::{AttrId, NotFound};
pub use session::{DiscoveryTier, PeerId, PeripheralInfo, PeripheralState};

mod attribute;
mod bridge;
mod buffer;
mod config;
mod context;
mod error;
mod event;
mod manager;
mod session;

pub mod btle;
pub mod common;
pub mod native;
pub mod registry;
