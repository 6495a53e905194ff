//! Interface of the host BLE stack.
//!
//! The bridge never talks to a radio itself. A [`NativeStack`] opens one
//! [`NativeCentral`] per manager; the central accepts requests synchronously and
//! reports every outcome later by posting a [`NativeEvent`] through the
//! [`NativeEvents`] handle it was opened with. Posted events land on the same
//! queue as caller requests, so the bridge observes them strictly in order.

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::context::Command;
use crate::error::NativeError;
use crate::event::DiscoveredPeripheral;
use crate::manager::ManagerId;
use crate::session::PeerId;

/// Bound for native attribute objects. Equality stands in for object identity;
/// the ordering only keys lookups.
pub trait NativeHandle: Clone + Ord + fmt::Debug + Send + 'static {}

impl<T> NativeHandle for T where T: Clone + Ord + fmt::Debug + Send + 'static {}

pub type NativeResult = Result<(), NativeError>;

/// A discovered service or descriptor as reported by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeAttribute<H> {
    pub handle: H,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCharacteristic<H> {
    pub handle: H,
    pub uuid: Uuid,
    pub properties: u8,
}

/// Opens central-role contexts on the host stack.
pub trait NativeStack: Send + 'static {
    type Central: NativeCentral;

    fn open(
        &mut self,
        manager: ManagerId,
        events: NativeEvents<Self::Central>,
    ) -> Result<Self::Central, NativeError>;
}

/// One central-role context on the host stack.
///
/// Every request method only submits the request. A returned error means the
/// request never reached the radio and no completion event will follow.
pub trait NativeCentral: Send + 'static {
    type Peer: Clone + Send + 'static;
    type Service: NativeHandle;
    type Characteristic: NativeHandle;
    type Descriptor: NativeHandle;

    fn scan(&mut self, allow_duplicates: bool);

    fn stop_scan(&mut self);

    /// Resolves a peer identity to a native peripheral, if the stack knows it.
    fn peripheral(&mut self, peer: &PeerId) -> Option<Self::Peer>;

    fn connect(&mut self, peer: &Self::Peer) -> NativeResult;

    /// Cancels a pending or established connection. A `Disconnected` event
    /// must eventually follow a successful call.
    fn cancel_connection(&mut self, peer: &Self::Peer) -> NativeResult;

    fn att_mtu(&self, peer: &Self::Peer) -> Option<u16>;

    fn discover_services(&mut self, peer: &Self::Peer, filter: &[Uuid]) -> NativeResult;

    fn discover_characteristics(
        &mut self,
        peer: &Self::Peer,
        service: &Self::Service,
        filter: &[Uuid],
    ) -> NativeResult;

    fn discover_descriptors(
        &mut self,
        peer: &Self::Peer,
        characteristic: &Self::Characteristic,
    ) -> NativeResult;

    fn read_characteristic(
        &mut self,
        peer: &Self::Peer,
        characteristic: &Self::Characteristic,
    ) -> NativeResult;

    fn write_characteristic(
        &mut self,
        peer: &Self::Peer,
        characteristic: &Self::Characteristic,
        value: &[u8],
        no_response: bool,
    ) -> NativeResult;

    fn read_descriptor(&mut self, peer: &Self::Peer, descriptor: &Self::Descriptor)
        -> NativeResult;

    fn write_descriptor(
        &mut self,
        peer: &Self::Peer,
        descriptor: &Self::Descriptor,
        value: &[u8],
    ) -> NativeResult;

    fn subscribe(&mut self, peer: &Self::Peer, characteristic: &Self::Characteristic)
        -> NativeResult;

    fn unsubscribe(
        &mut self,
        peer: &Self::Peer,
        characteristic: &Self::Characteristic,
    ) -> NativeResult;

    fn read_rssi(&mut self, peer: &Self::Peer) -> NativeResult;

    /// Called once when the owning manager is destroyed.
    fn close(&mut self) {}
}

/// Completion and delegate events produced by a native central.
pub enum NativeEvent<C: NativeCentral> {
    StateChanged {
        powered_on: bool,
        message: String,
    },
    PeripheralDiscovered(DiscoveredPeripheral),
    Connected {
        peer: PeerId,
        status: i32,
    },
    Disconnected {
        peer: PeerId,
        reason: i32,
    },
    ServicesDiscovered {
        peer: PeerId,
        status: i32,
        services: Vec<NativeAttribute<C::Service>>,
    },
    CharacteristicsDiscovered {
        peer: PeerId,
        status: i32,
        service: C::Service,
        characteristics: Vec<NativeCharacteristic<C::Characteristic>>,
    },
    DescriptorsDiscovered {
        peer: PeerId,
        status: i32,
        characteristic: C::Characteristic,
        descriptors: Vec<NativeAttribute<C::Descriptor>>,
    },
    /// Read response or notification value.
    CharacteristicRead {
        peer: PeerId,
        status: i32,
        uuid: Uuid,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        peer: PeerId,
        status: i32,
        uuid: Uuid,
    },
    DescriptorRead {
        peer: PeerId,
        status: i32,
        uuid: Uuid,
        value: Vec<u8>,
    },
    DescriptorWritten {
        peer: PeerId,
        status: i32,
        uuid: Uuid,
    },
    NotificationStateChanged {
        peer: PeerId,
        status: i32,
        uuid: Uuid,
        enabled: bool,
    },
    RssiRead {
        peer: PeerId,
        status: i32,
        rssi: i16,
    },
}

impl<C: NativeCentral> NativeEvent<C> {
    /// The peer the event concerns; `None` for manager-wide events.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            NativeEvent::StateChanged { .. } | NativeEvent::PeripheralDiscovered(_) => None,
            NativeEvent::Connected { peer, .. }
            | NativeEvent::Disconnected { peer, .. }
            | NativeEvent::ServicesDiscovered { peer, .. }
            | NativeEvent::CharacteristicsDiscovered { peer, .. }
            | NativeEvent::DescriptorsDiscovered { peer, .. }
            | NativeEvent::CharacteristicRead { peer, .. }
            | NativeEvent::CharacteristicWritten { peer, .. }
            | NativeEvent::DescriptorRead { peer, .. }
            | NativeEvent::DescriptorWritten { peer, .. }
            | NativeEvent::NotificationStateChanged { peer, .. }
            | NativeEvent::RssiRead { peer, .. } => Some(*peer),
        }
    }
}

impl<C: NativeCentral> fmt::Debug for NativeEvent<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeEvent::StateChanged { powered_on, message } => f
                .debug_struct("StateChanged")
                .field("powered_on", powered_on)
                .field("message", message)
                .finish(),
            NativeEvent::PeripheralDiscovered(record) => {
                f.debug_tuple("PeripheralDiscovered").field(record).finish()
            }
            NativeEvent::Connected { peer, status } => {
                write!(f, "Connected({}, status={})", peer, status)
            }
            NativeEvent::Disconnected { peer, reason } => {
                write!(f, "Disconnected({}, reason={})", peer, reason)
            }
            NativeEvent::ServicesDiscovered {
                peer,
                status,
                services,
            } => write!(
                f,
                "ServicesDiscovered({}, status={}, count={})",
                peer,
                status,
                services.len()
            ),
            NativeEvent::CharacteristicsDiscovered {
                peer,
                status,
                characteristics,
                ..
            } => write!(
                f,
                "CharacteristicsDiscovered({}, status={}, count={})",
                peer,
                status,
                characteristics.len()
            ),
            NativeEvent::DescriptorsDiscovered {
                peer,
                status,
                descriptors,
                ..
            } => write!(
                f,
                "DescriptorsDiscovered({}, status={}, count={})",
                peer,
                status,
                descriptors.len()
            ),
            NativeEvent::CharacteristicRead {
                peer,
                status,
                uuid,
                value,
            } => write!(
                f,
                "CharacteristicRead({}, status={}, uuid={}, len={})",
                peer,
                status,
                uuid,
                value.len()
            ),
            NativeEvent::CharacteristicWritten { peer, status, uuid } => write!(
                f,
                "CharacteristicWritten({}, status={}, uuid={})",
                peer, status, uuid
            ),
            NativeEvent::DescriptorRead {
                peer,
                status,
                uuid,
                value,
            } => write!(
                f,
                "DescriptorRead({}, status={}, uuid={}, len={})",
                peer,
                status,
                uuid,
                value.len()
            ),
            NativeEvent::DescriptorWritten { peer, status, uuid } => write!(
                f,
                "DescriptorWritten({}, status={}, uuid={})",
                peer, status, uuid
            ),
            NativeEvent::NotificationStateChanged {
                peer,
                status,
                uuid,
                enabled,
            } => write!(
                f,
                "NotificationStateChanged({}, status={}, uuid={}, enabled={})",
                peer, status, uuid, enabled
            ),
            NativeEvent::RssiRead { peer, status, rssi } => {
                write!(f, "RssiRead({}, status={}, rssi={})", peer, status, rssi)
            }
        }
    }
}

/// Posts native events onto the bridge's execution context.
pub struct NativeEvents<C: NativeCentral> {
    manager: ManagerId,
    tx: UnboundedSender<Command<C>>,
}

impl<C: NativeCentral> Clone for NativeEvents<C> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager,
            tx: self.tx.clone(),
        }
    }
}

impl<C: NativeCentral> NativeEvents<C> {
    pub(crate) fn new(manager: ManagerId, tx: UnboundedSender<Command<C>>) -> Self {
        Self { manager, tx }
    }

    pub fn manager(&self) -> ManagerId {
        self.manager
    }

    /// Enqueues `event`. Returns `false` once the bridge has shut down.
    pub fn post(&self, event: NativeEvent<C>) -> bool {
        self.tx
            .send(Command::Native {
                manager: self.manager,
                event,
            })
            .is_ok()
    }
}
