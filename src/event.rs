//! Events reported back to the caller.
//!
//! Every event is produced on the bridge's execution context, one at a time, in
//! the order the native stack delivered the underlying completion.

use tokio::sync::broadcast::Sender;
use uuid::Uuid;

use crate::attribute::{Characteristic, Descriptor, Service};
use crate::buffer::ByteView;
use crate::manager::ManagerId;
use crate::session::PeerId;

pub const STATUS_OK: i32 = 0;
/// The operation was still pending when the peer disconnected.
pub const STATUS_CANCELLED: i32 = -1;
/// The parent attribute of a discovery was invalidated before it completed.
pub const STATUS_STALE: i32 = -2;

/// Sentinel for an unknown TX power level or RSSI.
pub const POWER_LEVEL_UNKNOWN: i16 = -128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: Uuid,
    pub data: Vec<u8>,
}

/// One advertisement observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub peer_id: PeerId,
    pub rssi: i16,
    pub local_name: Option<String>,
    /// TX power level, [`POWER_LEVEL_UNKNOWN`] if not advertised.
    pub power_level: i16,
    pub connectable: bool,
    pub manufacturer_data: Option<Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
    pub service_data: Vec<ServiceData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    StateChanged {
        manager: ManagerId,
        powered_on: bool,
        message: String,
    },
    PeripheralDiscovered {
        manager: ManagerId,
        record: DiscoveredPeripheral,
    },
    PeripheralConnected {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
    },
    PeripheralDisconnected {
        manager: ManagerId,
        peer: PeerId,
        reason: i32,
    },
    ServicesDiscovered {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        services: Vec<Service>,
    },
    CharacteristicsDiscovered {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        characteristics: Vec<Characteristic>,
    },
    DescriptorsDiscovered {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        descriptors: Vec<Descriptor>,
    },
    CharacteristicRead {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        uuid: Uuid,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        uuid: Uuid,
    },
    DescriptorRead {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        uuid: Uuid,
        value: Vec<u8>,
    },
    DescriptorWritten {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        uuid: Uuid,
    },
    NotificationStateChanged {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        uuid: Uuid,
        enabled: bool,
    },
    RssiRead {
        manager: ManagerId,
        peer: PeerId,
        status: i32,
        rssi: i16,
    },
}

impl BridgeEvent {
    pub fn manager(&self) -> ManagerId {
        match self {
            BridgeEvent::StateChanged { manager, .. }
            | BridgeEvent::PeripheralDiscovered { manager, .. }
            | BridgeEvent::PeripheralConnected { manager, .. }
            | BridgeEvent::PeripheralDisconnected { manager, .. }
            | BridgeEvent::ServicesDiscovered { manager, .. }
            | BridgeEvent::CharacteristicsDiscovered { manager, .. }
            | BridgeEvent::DescriptorsDiscovered { manager, .. }
            | BridgeEvent::CharacteristicRead { manager, .. }
            | BridgeEvent::CharacteristicWritten { manager, .. }
            | BridgeEvent::DescriptorRead { manager, .. }
            | BridgeEvent::DescriptorWritten { manager, .. }
            | BridgeEvent::NotificationStateChanged { manager, .. }
            | BridgeEvent::RssiRead { manager, .. } => *manager,
        }
    }

    /// The peer the event concerns; `None` for manager-wide events.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            BridgeEvent::StateChanged { .. } => None,
            BridgeEvent::PeripheralDiscovered { record, .. } => Some(record.peer_id),
            BridgeEvent::PeripheralConnected { peer, .. }
            | BridgeEvent::PeripheralDisconnected { peer, .. }
            | BridgeEvent::ServicesDiscovered { peer, .. }
            | BridgeEvent::CharacteristicsDiscovered { peer, .. }
            | BridgeEvent::DescriptorsDiscovered { peer, .. }
            | BridgeEvent::CharacteristicRead { peer, .. }
            | BridgeEvent::CharacteristicWritten { peer, .. }
            | BridgeEvent::DescriptorRead { peer, .. }
            | BridgeEvent::DescriptorWritten { peer, .. }
            | BridgeEvent::NotificationStateChanged { peer, .. }
            | BridgeEvent::RssiRead { peer, .. } => Some(*peer),
        }
    }

    /// Invokes the handler callback matching this event.
    pub fn dispatch_to(&self, handler: &mut dyn EventHandler) {
        match self {
            BridgeEvent::StateChanged {
                manager,
                powered_on,
                message,
            } => handler.on_state_changed(*manager, *powered_on, message),
            BridgeEvent::PeripheralDiscovered { manager, record } => {
                handler.on_peripheral_discovered(*manager, record)
            }
            BridgeEvent::PeripheralConnected {
                manager,
                peer,
                status,
            } => handler.on_peripheral_connected(*manager, peer, *status),
            BridgeEvent::PeripheralDisconnected {
                manager,
                peer,
                reason,
            } => handler.on_peripheral_disconnected(*manager, peer, *reason),
            BridgeEvent::ServicesDiscovered {
                manager,
                peer,
                status,
                services,
            } => handler.on_services_discovered(*manager, peer, *status, services),
            BridgeEvent::CharacteristicsDiscovered {
                manager,
                peer,
                status,
                characteristics,
            } => handler.on_characteristics_discovered(*manager, peer, *status, characteristics),
            BridgeEvent::DescriptorsDiscovered {
                manager,
                peer,
                status,
                descriptors,
            } => handler.on_descriptors_discovered(*manager, peer, *status, descriptors),
            BridgeEvent::CharacteristicRead {
                manager,
                peer,
                status,
                uuid,
                value,
            } => handler.on_characteristic_read(*manager, peer, *status, uuid, ByteView::from(value)),
            BridgeEvent::CharacteristicWritten {
                manager,
                peer,
                status,
                uuid,
            } => handler.on_characteristic_written(*manager, peer, *status, uuid),
            BridgeEvent::DescriptorRead {
                manager,
                peer,
                status,
                uuid,
                value,
            } => handler.on_descriptor_read(*manager, peer, *status, uuid, ByteView::from(value)),
            BridgeEvent::DescriptorWritten {
                manager,
                peer,
                status,
                uuid,
            } => handler.on_descriptor_written(*manager, peer, *status, uuid),
            BridgeEvent::NotificationStateChanged {
                manager,
                peer,
                status,
                uuid,
                enabled,
            } => handler.on_notification_state_changed(*manager, peer, *status, uuid, *enabled),
            BridgeEvent::RssiRead {
                manager,
                peer,
                status,
                rssi,
            } => handler.on_rssi_read(*manager, peer, *status, *rssi),
        }
    }
}

/// Callback contract for asynchronous results.
///
/// Callbacks run on the bridge's execution context and must not block. Byte
/// payloads are borrowed for the duration of the call only.
#[allow(unused_variables)]
pub trait EventHandler: Send + 'static {
    fn on_state_changed(&mut self, manager: ManagerId, powered_on: bool, message: &str) {}

    fn on_peripheral_discovered(&mut self, manager: ManagerId, record: &DiscoveredPeripheral) {}

    fn on_peripheral_connected(&mut self, manager: ManagerId, peer: &PeerId, status: i32) {}

    fn on_peripheral_disconnected(&mut self, manager: ManagerId, peer: &PeerId, reason: i32) {}

    fn on_services_discovered(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        services: &[Service],
    ) {
    }

    fn on_characteristics_discovered(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        characteristics: &[Characteristic],
    ) {
    }

    fn on_descriptors_discovered(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        descriptors: &[Descriptor],
    ) {
    }

    fn on_characteristic_read(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        uuid: &Uuid,
        value: ByteView<'_>,
    ) {
    }

    /// Never called for writes issued without response.
    fn on_characteristic_written(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        uuid: &Uuid,
    ) {
    }

    fn on_descriptor_read(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        uuid: &Uuid,
        value: ByteView<'_>,
    ) {
    }

    fn on_descriptor_written(&mut self, manager: ManagerId, peer: &PeerId, status: i32, uuid: &Uuid) {
    }

    fn on_notification_state_changed(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        uuid: &Uuid,
        enabled: bool,
    ) {
    }

    fn on_rssi_read(&mut self, manager: ManagerId, peer: &PeerId, status: i32, rssi: i16) {}
}

/// Fans each event out to the registered handler and to event streams.
pub(crate) struct Dispatch {
    handler: Option<Box<dyn EventHandler>>,
    event_sender: Sender<BridgeEvent>,
}

impl Dispatch {
    pub(crate) fn new(
        handler: Option<Box<dyn EventHandler>>,
        event_sender: Sender<BridgeEvent>,
    ) -> Self {
        Self {
            handler,
            event_sender,
        }
    }

    pub(crate) fn emit(&mut self, event: BridgeEvent) {
        log::trace!("Dispatching {:?}", event);

        if let Some(handler) = self.handler.as_deref_mut() {
            event.dispatch_to(handler);
        }

        // No subscribed streams is not an error.
        self.event_sender.send(event).ok();
    }
}
