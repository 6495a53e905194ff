//! Per-peer connection state, attribute cache and pending operations.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::attribute::AttributeTree;
use crate::error::{BridgeError, NativeError, Result};
use crate::event::{
    BridgeEvent, Dispatch, POWER_LEVEL_UNKNOWN, STATUS_CANCELLED, STATUS_OK, STATUS_STALE,
};
use crate::manager::ManagerId;
use crate::native::{NativeAttribute, NativeCentral, NativeCharacteristic};
use crate::registry::{AttrId, IdAllocator};

/// Identity of a remote peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    pub const fn from_uuid(uuid: Uuid) -> Self {
        PeerId(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for PeerId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(PeerId)
            .map_err(|_| BridgeError::InvalidPeerId(s.to_string()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Attribute tier with a discovery in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTier {
    Services,
    Characteristics,
    Descriptors,
}

/// Snapshot of a peripheral session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub peer: PeerId,
    pub state: PeripheralState,
    /// Last RSSI seen in an advertisement or an RSSI read.
    pub rssi: Option<i16>,
    /// Tiers with a discovery in flight, oldest request first.
    pub discovering: Vec<DiscoveryTier>,
    pub pending_operations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Services,
    Characteristics(AttrId),
    Descriptors(AttrId),
    ReadCharacteristic(Uuid),
    WriteCharacteristic(Uuid),
    ReadDescriptor(Uuid),
    WriteDescriptor(Uuid),
    NotifyState(Uuid),
    Rssi,
}

impl Pending {
    fn tier(&self) -> Option<DiscoveryTier> {
        match self {
            Pending::Services => Some(DiscoveryTier::Services),
            Pending::Characteristics(_) => Some(DiscoveryTier::Characteristics),
            Pending::Descriptors(_) => Some(DiscoveryTier::Descriptors),
            _ => None,
        }
    }
}

type Tree<C> = AttributeTree<
    <C as NativeCentral>::Service,
    <C as NativeCentral>::Characteristic,
    <C as NativeCentral>::Descriptor,
>;

pub(crate) struct PeripheralSession<C: NativeCentral> {
    manager: ManagerId,
    id: PeerId,
    peer: C::Peer,
    state: PeripheralState,
    rssi: Option<i16>,
    tree: Tree<C>,
    pending: VecDeque<Pending>,
    /// Characteristics whose values are forwarded as notifications.
    subscriptions: BTreeSet<Uuid>,
}

impl<C: NativeCentral> PeripheralSession<C> {
    pub(crate) fn new(manager: ManagerId, id: PeerId, peer: C::Peer) -> Self {
        Self {
            manager,
            id,
            peer,
            state: PeripheralState::Disconnected,
            rssi: None,
            tree: Tree::<C>::new(),
            pending: VecDeque::new(),
            subscriptions: BTreeSet::new(),
        }
    }

    pub(crate) fn state(&self) -> PeripheralState {
        self.state
    }

    pub(crate) fn info(&self) -> PeripheralInfo {
        PeripheralInfo {
            peer: self.id,
            state: self.state,
            rssi: self.rssi,
            discovering: self.pending.iter().filter_map(Pending::tier).collect(),
            pending_operations: self.pending.len(),
        }
    }

    pub(crate) fn tree(&self) -> &Tree<C> {
        &self.tree
    }

    fn require_connected(&self) -> Result<()> {
        if self.state == PeripheralState::Connected {
            Ok(())
        } else {
            Err(BridgeError::NotConnected(self.id))
        }
    }

    fn invalid_state(&self) -> BridgeError {
        BridgeError::InvalidState {
            peer: self.id,
            state: self.state,
        }
    }

    fn take_pending(&mut self, matches: impl Fn(&Pending) -> bool) -> Option<Pending> {
        let index = self.pending.iter().position(matches)?;
        self.pending.remove(index)
    }

    pub(crate) fn connect(&mut self, native: &mut C) -> Result<()> {
        if self.state != PeripheralState::Disconnected {
            return Err(self.invalid_state());
        }

        native.connect(&self.peer)?;
        self.state = PeripheralState::Connecting;

        log::info!("Connecting to {}", self.id);
        Ok(())
    }

    pub(crate) fn disconnect(&mut self, native: &mut C) -> Result<()> {
        match self.state {
            PeripheralState::Connecting | PeripheralState::Connected => {}
            _ => return Err(self.invalid_state()),
        }

        native.cancel_connection(&self.peer)?;
        self.state = PeripheralState::Disconnecting;

        log::info!("Disconnecting from {}", self.id);
        Ok(())
    }

    pub(crate) fn att_mtu(&self, native: &C) -> Result<u16> {
        self.require_connected()?;

        native
            .att_mtu(&self.peer)
            .ok_or_else(|| NativeError::NotSupported("ATT MTU unavailable".into()).into())
    }

    pub(crate) fn discover_services(&mut self, native: &mut C, filter: &[Uuid]) -> Result<()> {
        self.require_connected()?;

        native.discover_services(&self.peer, filter)?;
        self.pending.push_back(Pending::Services);

        log::debug!("Discovering services of {}", self.id);
        Ok(())
    }

    pub(crate) fn discover_characteristics(
        &mut self,
        native: &mut C,
        service: AttrId,
        filter: &[Uuid],
    ) -> Result<()> {
        self.require_connected()?;

        let (handle, uuid) = self.tree.service(service)?;
        native.discover_characteristics(&self.peer, handle, filter)?;
        self.pending.push_back(Pending::Characteristics(service));

        log::debug!("Discovering characteristics of {} on {}", uuid, self.id);
        Ok(())
    }

    pub(crate) fn discover_descriptors(&mut self, native: &mut C, characteristic: AttrId) -> Result<()> {
        self.require_connected()?;

        let (handle, uuid) = self.tree.characteristic(characteristic)?;
        native.discover_descriptors(&self.peer, handle)?;
        self.pending.push_back(Pending::Descriptors(characteristic));

        log::debug!("Discovering descriptors of {} on {}", uuid, self.id);
        Ok(())
    }

    pub(crate) fn read_characteristic(&mut self, native: &mut C, characteristic: AttrId) -> Result<()> {
        self.require_connected()?;

        let (handle, uuid) = self.tree.characteristic(characteristic)?;
        native.read_characteristic(&self.peer, handle)?;
        self.pending.push_back(Pending::ReadCharacteristic(uuid));

        log::debug!("Reading {} on {}", uuid, self.id);
        Ok(())
    }

    pub(crate) fn write_characteristic(
        &mut self,
        native: &mut C,
        characteristic: AttrId,
        value: &[u8],
        no_response: bool,
    ) -> Result<()> {
        self.require_connected()?;

        let (handle, uuid) = self.tree.characteristic(characteristic)?;
        native.write_characteristic(&self.peer, handle, value, no_response)?;
        // Writes without response never complete.
        if !no_response {
            self.pending.push_back(Pending::WriteCharacteristic(uuid));
        }

        log::debug!("Writing {} bytes to {} on {}", value.len(), uuid, self.id);
        Ok(())
    }

    pub(crate) fn read_descriptor(&mut self, native: &mut C, descriptor: AttrId) -> Result<()> {
        self.require_connected()?;

        let (handle, uuid) = self.tree.descriptor(descriptor)?;
        native.read_descriptor(&self.peer, handle)?;
        self.pending.push_back(Pending::ReadDescriptor(uuid));

        log::debug!("Reading descriptor {} on {}", uuid, self.id);
        Ok(())
    }

    pub(crate) fn write_descriptor(&mut self, native: &mut C, descriptor: AttrId, value: &[u8]) -> Result<()> {
        self.require_connected()?;

        let (handle, uuid) = self.tree.descriptor(descriptor)?;
        native.write_descriptor(&self.peer, handle, value)?;
        self.pending.push_back(Pending::WriteDescriptor(uuid));

        log::debug!("Writing {} bytes to descriptor {} on {}", value.len(), uuid, self.id);
        Ok(())
    }

    pub(crate) fn set_notify(&mut self, native: &mut C, characteristic: AttrId, enable: bool) -> Result<()> {
        self.require_connected()?;

        let (handle, uuid) = self.tree.characteristic(characteristic)?;
        if enable {
            native.subscribe(&self.peer, handle)?;
        } else {
            native.unsubscribe(&self.peer, handle)?;
        }
        self.pending.push_back(Pending::NotifyState(uuid));

        log::debug!(
            "{} notifications of {} on {}",
            if enable { "Enabling" } else { "Disabling" },
            uuid,
            self.id
        );
        Ok(())
    }

    pub(crate) fn read_rssi(&mut self, native: &mut C) -> Result<()> {
        if self.state == PeripheralState::Disconnected {
            return Err(BridgeError::NotConnected(self.id));
        }

        native.read_rssi(&self.peer)?;
        self.pending.push_back(Pending::Rssi);
        Ok(())
    }

    pub(crate) fn observe_rssi(&mut self, rssi: i16) {
        if rssi != POWER_LEVEL_UNKNOWN {
            self.rssi = Some(rssi);
        }
    }

    /// Drops the link and reports everything still outstanding. Used when the
    /// owning manager goes away.
    pub(crate) fn teardown(&mut self, native: &mut C, out: &mut Dispatch) {
        if self.state == PeripheralState::Disconnected {
            return;
        }

        if matches!(
            self.state,
            PeripheralState::Connecting | PeripheralState::Connected
        ) {
            if let Err(e) = native.cancel_connection(&self.peer) {
                log::warn!("Could not cancel connection to {}: {}", self.id, e);
            }
        }

        self.on_disconnected(STATUS_CANCELLED, out);
    }

    pub(crate) fn on_connected(&mut self, status: i32, out: &mut Dispatch) {
        match self.state {
            PeripheralState::Connecting => {
                if status == STATUS_OK {
                    log::info!("Connected to {}", self.id);
                    self.state = PeripheralState::Connected;
                } else {
                    log::warn!("Could not connect to {}: status={}", self.id, status);
                    self.end_link(out);
                }
            }
            // The confirmation of the cancel is still on its way.
            PeripheralState::Disconnecting => {}
            PeripheralState::Connected | PeripheralState::Disconnected => {
                log::warn!(
                    "Ignoring connect result for {} while {:?}",
                    self.id,
                    self.state
                );
                return;
            }
        }

        out.emit(BridgeEvent::PeripheralConnected {
            manager: self.manager,
            peer: self.id,
            status,
        });
    }

    pub(crate) fn on_disconnected(&mut self, reason: i32, out: &mut Dispatch) {
        if self.state == PeripheralState::Disconnected {
            log::debug!("Ignoring repeated disconnect of {}", self.id);
            return;
        }

        self.end_link(out);
        log::info!("Disconnected from {}: reason={}", self.id, reason);

        out.emit(BridgeEvent::PeripheralDisconnected {
            manager: self.manager,
            peer: self.id,
            reason,
        });
    }

    /// Cancels everything outstanding on the link and forgets its subscriptions.
    fn end_link(&mut self, out: &mut Dispatch) {
        while let Some(pending) = self.pending.pop_front() {
            self.cancel(pending, out);
        }

        self.subscriptions.clear();
        self.state = PeripheralState::Disconnected;
    }

    fn cancel(&self, pending: Pending, out: &mut Dispatch) {
        let (manager, peer, status) = (self.manager, self.id, STATUS_CANCELLED);

        log::debug!("Cancelling {:?} on {}", pending, peer);

        out.emit(match pending {
            Pending::Services => BridgeEvent::ServicesDiscovered {
                manager,
                peer,
                status,
                services: Vec::new(),
            },
            Pending::Characteristics(_) => BridgeEvent::CharacteristicsDiscovered {
                manager,
                peer,
                status,
                characteristics: Vec::new(),
            },
            Pending::Descriptors(_) => BridgeEvent::DescriptorsDiscovered {
                manager,
                peer,
                status,
                descriptors: Vec::new(),
            },
            Pending::ReadCharacteristic(uuid) => BridgeEvent::CharacteristicRead {
                manager,
                peer,
                status,
                uuid,
                value: Vec::new(),
            },
            Pending::WriteCharacteristic(uuid) => BridgeEvent::CharacteristicWritten {
                manager,
                peer,
                status,
                uuid,
            },
            Pending::ReadDescriptor(uuid) => BridgeEvent::DescriptorRead {
                manager,
                peer,
                status,
                uuid,
                value: Vec::new(),
            },
            Pending::WriteDescriptor(uuid) => BridgeEvent::DescriptorWritten {
                manager,
                peer,
                status,
                uuid,
            },
            Pending::NotifyState(uuid) => BridgeEvent::NotificationStateChanged {
                manager,
                peer,
                status,
                uuid,
                enabled: false,
            },
            Pending::Rssi => BridgeEvent::RssiRead {
                manager,
                peer,
                status,
                rssi: POWER_LEVEL_UNKNOWN,
            },
        });
    }

    fn unmatched(&self, what: &str) {
        log::debug!("Dropping {} for {} without a pending request", what, self.id);
    }

    pub(crate) fn on_services_discovered(
        &mut self,
        status: i32,
        services: Vec<NativeAttribute<C::Service>>,
        ids: &mut IdAllocator,
        out: &mut Dispatch,
    ) {
        if self.take_pending(|p| *p == Pending::Services).is_none() {
            return self.unmatched("service discovery");
        }

        let services = if status == STATUS_OK {
            self.tree.replace_services(ids, services)
        } else {
            Vec::new()
        };

        out.emit(BridgeEvent::ServicesDiscovered {
            manager: self.manager,
            peer: self.id,
            status,
            services,
        });
    }

    pub(crate) fn on_characteristics_discovered(
        &mut self,
        status: i32,
        service: &C::Service,
        characteristics: Vec<NativeCharacteristic<C::Characteristic>>,
        ids: &mut IdAllocator,
        out: &mut Dispatch,
    ) {
        let current = self.tree.service_id(service);
        let requested = match self
            .take_pending(|p| Some(*p) == current.map(Pending::Characteristics))
            .or_else(|| self.take_pending(|p| matches!(p, Pending::Characteristics(_))))
        {
            Some(Pending::Characteristics(id)) => id,
            _ => return self.unmatched("characteristic discovery"),
        };

        let (status, characteristics) = match current {
            Some(id) if id == requested && status == STATUS_OK => {
                match self.tree.replace_characteristics(ids, id, characteristics) {
                    Ok(found) => (status, found),
                    Err(_) => (STATUS_STALE, Vec::new()),
                }
            }
            Some(id) if id == requested => (status, Vec::new()),
            _ => {
                log::warn!("Service {} of {} was rediscovered before its characteristics", requested, self.id);
                (STATUS_STALE, Vec::new())
            }
        };

        out.emit(BridgeEvent::CharacteristicsDiscovered {
            manager: self.manager,
            peer: self.id,
            status,
            characteristics,
        });
    }

    pub(crate) fn on_descriptors_discovered(
        &mut self,
        status: i32,
        characteristic: &C::Characteristic,
        descriptors: Vec<NativeAttribute<C::Descriptor>>,
        ids: &mut IdAllocator,
        out: &mut Dispatch,
    ) {
        let current = self.tree.characteristic_id(characteristic);
        let requested = match self
            .take_pending(|p| Some(*p) == current.map(Pending::Descriptors))
            .or_else(|| self.take_pending(|p| matches!(p, Pending::Descriptors(_))))
        {
            Some(Pending::Descriptors(id)) => id,
            _ => return self.unmatched("descriptor discovery"),
        };

        let (status, descriptors) = match current {
            Some(id) if id == requested && status == STATUS_OK => {
                match self.tree.replace_descriptors(ids, id, descriptors) {
                    Ok(found) => (status, found),
                    Err(_) => (STATUS_STALE, Vec::new()),
                }
            }
            Some(id) if id == requested => (status, Vec::new()),
            _ => {
                log::warn!("Characteristic {} of {} was rediscovered before its descriptors", requested, self.id);
                (STATUS_STALE, Vec::new())
            }
        };

        out.emit(BridgeEvent::DescriptorsDiscovered {
            manager: self.manager,
            peer: self.id,
            status,
            descriptors,
        });
    }

    pub(crate) fn on_characteristic_read(
        &mut self,
        status: i32,
        uuid: Uuid,
        value: Vec<u8>,
        forward_notifications: bool,
        out: &mut Dispatch,
    ) {
        let requested = self
            .take_pending(|p| *p == Pending::ReadCharacteristic(uuid))
            .is_some();

        // Without a pending read this is a notification or indication.
        let notification = !requested
            && forward_notifications
            && status == STATUS_OK
            && self.state == PeripheralState::Connected
            && self.subscriptions.contains(&uuid);

        if !requested && !notification {
            return self.unmatched("characteristic value");
        }

        out.emit(BridgeEvent::CharacteristicRead {
            manager: self.manager,
            peer: self.id,
            status,
            uuid,
            value: if status == STATUS_OK { value } else { Vec::new() },
        });
    }

    pub(crate) fn on_characteristic_written(&mut self, status: i32, uuid: Uuid, out: &mut Dispatch) {
        if self
            .take_pending(|p| *p == Pending::WriteCharacteristic(uuid))
            .is_none()
        {
            return self.unmatched("characteristic write");
        }

        out.emit(BridgeEvent::CharacteristicWritten {
            manager: self.manager,
            peer: self.id,
            status,
            uuid,
        });
    }

    pub(crate) fn on_descriptor_read(&mut self, status: i32, uuid: Uuid, value: Vec<u8>, out: &mut Dispatch) {
        if self
            .take_pending(|p| *p == Pending::ReadDescriptor(uuid))
            .is_none()
        {
            return self.unmatched("descriptor value");
        }

        out.emit(BridgeEvent::DescriptorRead {
            manager: self.manager,
            peer: self.id,
            status,
            uuid,
            value: if status == STATUS_OK { value } else { Vec::new() },
        });
    }

    pub(crate) fn on_descriptor_written(&mut self, status: i32, uuid: Uuid, out: &mut Dispatch) {
        if self
            .take_pending(|p| *p == Pending::WriteDescriptor(uuid))
            .is_none()
        {
            return self.unmatched("descriptor write");
        }

        out.emit(BridgeEvent::DescriptorWritten {
            manager: self.manager,
            peer: self.id,
            status,
            uuid,
        });
    }

    pub(crate) fn on_notification_state_changed(
        &mut self,
        status: i32,
        uuid: Uuid,
        enabled: bool,
        out: &mut Dispatch,
    ) {
        if self
            .take_pending(|p| *p == Pending::NotifyState(uuid))
            .is_none()
        {
            return self.unmatched("notification state");
        }

        if status == STATUS_OK {
            if enabled {
                self.subscriptions.insert(uuid);
            } else {
                self.subscriptions.remove(&uuid);
            }
        }

        out.emit(BridgeEvent::NotificationStateChanged {
            manager: self.manager,
            peer: self.id,
            status,
            uuid,
            enabled,
        });
    }

    pub(crate) fn on_rssi_read(&mut self, status: i32, rssi: i16, out: &mut Dispatch) {
        if self.take_pending(|p| *p == Pending::Rssi).is_none() {
            return self.unmatched("RSSI");
        }

        if status == STATUS_OK {
            self.observe_rssi(rssi);
        }

        out.emit(BridgeEvent::RssiRead {
            manager: self.manager,
            peer: self.id,
            status,
            rssi: if status == STATUS_OK { rssi } else { POWER_LEVEL_UNKNOWN },
        });
    }
}
