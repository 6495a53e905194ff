//! Central-role contexts and the table that owns them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::BridgeConfig;
use crate::context::Command;
use crate::error::{BridgeError, Result};
use crate::event::{BridgeEvent, Dispatch, DiscoveredPeripheral};
use crate::native::{NativeCentral, NativeEvent, NativeEvents, NativeStack};
use crate::registry::IdAllocator;
use crate::session::{PeerId, PeripheralSession, PeripheralState};

/// Opaque identifier of a central manager. Stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerId(u64);

impl ManagerId {
    pub const fn from_raw(raw: u64) -> Self {
        ManagerId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a central manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerInfo {
    pub id: ManagerId,
    pub powered_on: bool,
    pub scanning: bool,
    /// Peers with a live session.
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanMode {
    allow_duplicates: bool,
}

/// One central-role context with its own scan state and peripheral sessions.
pub(crate) struct CentralManager<C: NativeCentral> {
    id: ManagerId,
    native: C,
    powered_on: bool,
    scan: Option<ScanMode>,
    /// Peers reported since the scan started, for duplicate suppression.
    reported: HashSet<PeerId>,
    sessions: HashMap<PeerId, PeripheralSession<C>>,
}

impl<C: NativeCentral> CentralManager<C> {
    fn new(id: ManagerId, native: C) -> Self {
        Self {
            id,
            native,
            powered_on: false,
            scan: None,
            reported: HashSet::new(),
            sessions: HashMap::new(),
        }
    }

    pub(crate) fn info(&self) -> ManagerInfo {
        let mut peers: Vec<_> = self.sessions.keys().copied().collect();
        peers.sort();

        ManagerInfo {
            id: self.id,
            powered_on: self.powered_on,
            scanning: self.scan.is_some(),
            peers,
        }
    }

    pub(crate) fn scan(&mut self, allow_duplicates: bool) -> Result<()> {
        if self.scan.is_some() {
            return Err(BridgeError::AlreadyScanning);
        }

        self.reported.clear();
        self.native.scan(allow_duplicates);
        self.scan = Some(ScanMode { allow_duplicates });

        log::info!(
            "Manager {} started scanning (duplicates {})",
            self.id,
            if allow_duplicates { "allowed" } else { "suppressed" }
        );
        Ok(())
    }

    pub(crate) fn stop_scan(&mut self) {
        if self.scan.take().is_none() {
            log::info!("Manager {} is not scanning", self.id);
            return;
        }

        self.native.stop_scan();
        self.reported.clear();

        log::info!("Manager {} stopped scanning", self.id);
    }

    /// Resolves `peer` to its session, creating the session on first use if
    /// the native stack knows the peer.
    pub(crate) fn session_mut(&mut self, peer: PeerId) -> Result<(&mut PeripheralSession<C>, &mut C)> {
        if !self.sessions.contains_key(&peer) {
            let native_peer = self
                .native
                .peripheral(&peer)
                .ok_or(BridgeError::UnknownPeer(peer))?;

            log::debug!("Manager {} tracking peer {}", self.id, peer);
            self.sessions
                .insert(peer, PeripheralSession::new(self.id, peer, native_peer));
        }

        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(BridgeError::UnknownPeer(peer))?;

        Ok((session, &mut self.native))
    }

    pub(crate) fn session(&self, peer: PeerId) -> Result<&PeripheralSession<C>> {
        self.sessions.get(&peer).ok_or(BridgeError::UnknownPeer(peer))
    }

    pub(crate) fn forget(&mut self, peer: PeerId) -> Result<()> {
        let state = self.session(peer)?.state();
        if state != PeripheralState::Disconnected {
            return Err(BridgeError::InvalidState { peer, state });
        }

        self.sessions.remove(&peer);
        log::debug!("Manager {} forgot peer {}", self.id, peer);
        Ok(())
    }

    fn teardown(&mut self, out: &mut Dispatch) {
        if self.scan.is_some() {
            self.stop_scan();
        }

        for (_, mut session) in self.sessions.drain() {
            session.teardown(&mut self.native, out);
        }

        self.native.close();
    }

    fn on_peripheral_discovered(&mut self, record: DiscoveredPeripheral, out: &mut Dispatch) {
        if let Some(session) = self.sessions.get_mut(&record.peer_id) {
            session.observe_rssi(record.rssi);
        }

        let Some(mode) = self.scan else {
            log::trace!("Manager {} not scanning, dropping {}", self.id, record.peer_id);
            return;
        };

        if !self.reported.insert(record.peer_id) && !mode.allow_duplicates {
            return;
        }

        out.emit(BridgeEvent::PeripheralDiscovered {
            manager: self.id,
            record,
        });
    }

    fn on_manager_event(&mut self, event: NativeEvent<C>, out: &mut Dispatch) {
        match event {
            NativeEvent::StateChanged {
                powered_on,
                message,
            } => {
                log::info!(
                    "Manager {} powered {}: {}",
                    self.id,
                    if powered_on { "on" } else { "off" },
                    message
                );
                self.powered_on = powered_on;
                if !powered_on {
                    // The host stack drops the scan when the radio goes away.
                    self.scan = None;
                    self.reported.clear();
                }
                out.emit(BridgeEvent::StateChanged {
                    manager: self.id,
                    powered_on,
                    message,
                });
            }
            NativeEvent::PeripheralDiscovered(record) => self.on_peripheral_discovered(record, out),
            other => log::warn!("Manager {} cannot route {:?}", self.id, other),
        }
    }

    fn on_native(
        &mut self,
        event: NativeEvent<C>,
        ids: &mut IdAllocator,
        config: &BridgeConfig,
        out: &mut Dispatch,
    ) {
        log::trace!("Manager {} native event: {:?}", self.id, event);

        let Some(peer) = event.peer() else {
            return self.on_manager_event(event, out);
        };

        let Some(session) = self.sessions.get_mut(&peer) else {
            log::warn!("Manager {} has no session for {}: {:?}", self.id, peer, event);
            return;
        };

        match event {
            NativeEvent::Connected { status, .. } => session.on_connected(status, out),
            NativeEvent::Disconnected { reason, .. } => session.on_disconnected(reason, out),
            NativeEvent::ServicesDiscovered {
                status, services, ..
            } => session.on_services_discovered(status, services, ids, out),
            NativeEvent::CharacteristicsDiscovered {
                status,
                service,
                characteristics,
                ..
            } => session.on_characteristics_discovered(status, &service, characteristics, ids, out),
            NativeEvent::DescriptorsDiscovered {
                status,
                characteristic,
                descriptors,
                ..
            } => session.on_descriptors_discovered(status, &characteristic, descriptors, ids, out),
            NativeEvent::CharacteristicRead {
                status,
                uuid,
                value,
                ..
            } => session.on_characteristic_read(status, uuid, value, config.forward_notifications, out),
            NativeEvent::CharacteristicWritten { status, uuid, .. } => {
                session.on_characteristic_written(status, uuid, out)
            }
            NativeEvent::DescriptorRead {
                status,
                uuid,
                value,
                ..
            } => session.on_descriptor_read(status, uuid, value, out),
            NativeEvent::DescriptorWritten { status, uuid, .. } => {
                session.on_descriptor_written(status, uuid, out)
            }
            NativeEvent::NotificationStateChanged {
                status,
                uuid,
                enabled,
                ..
            } => session.on_notification_state_changed(status, uuid, enabled, out),
            NativeEvent::RssiRead { status, rssi, .. } => session.on_rssi_read(status, rssi, out),
            NativeEvent::StateChanged { .. } | NativeEvent::PeripheralDiscovered(_) => {}
        }
    }
}

/// Process-wide table of central managers.
pub(crate) struct ManagerTable<S: NativeStack> {
    stack: S,
    managers: BTreeMap<ManagerId, CentralManager<S::Central>>,
    next_manager: u64,
    ids: IdAllocator,
    commands: UnboundedSender<Command<S::Central>>,
}

impl<S: NativeStack> ManagerTable<S> {
    pub(crate) fn new(stack: S, commands: UnboundedSender<Command<S::Central>>) -> Self {
        Self {
            stack,
            managers: BTreeMap::new(),
            next_manager: 1,
            ids: IdAllocator::new(),
            commands,
        }
    }

    pub(crate) fn allocate(&mut self) -> Result<ManagerId> {
        let id = ManagerId(self.next_manager);
        let events = NativeEvents::new(id, self.commands.clone());
        let native = self.stack.open(id, events)?;

        self.next_manager += 1;
        self.managers.insert(id, CentralManager::new(id, native));

        log::info!("Allocated central manager {}", id);
        Ok(id)
    }

    pub(crate) fn destroy(&mut self, id: ManagerId, out: &mut Dispatch) -> Result<()> {
        let mut manager = self
            .managers
            .remove(&id)
            .ok_or(BridgeError::UnknownManager(id))?;
        manager.teardown(out);

        log::info!("Destroyed central manager {}", id);
        Ok(())
    }

    pub(crate) fn destroy_all(&mut self, out: &mut Dispatch) {
        let ids: Vec<_> = self.managers.keys().copied().collect();
        for id in ids {
            self.destroy(id, out).ok();
        }
    }

    pub(crate) fn ids(&self) -> Vec<ManagerId> {
        self.managers.keys().copied().collect()
    }

    pub(crate) fn get(&self, id: ManagerId) -> Result<&CentralManager<S::Central>> {
        self.managers.get(&id).ok_or(BridgeError::UnknownManager(id))
    }

    pub(crate) fn get_mut(&mut self, id: ManagerId) -> Result<&mut CentralManager<S::Central>> {
        self.managers
            .get_mut(&id)
            .ok_or(BridgeError::UnknownManager(id))
    }

    pub(crate) fn on_native(
        &mut self,
        id: ManagerId,
        event: NativeEvent<S::Central>,
        config: &BridgeConfig,
        out: &mut Dispatch,
    ) {
        match self.managers.get_mut(&id) {
            Some(manager) => manager.on_native(event, &mut self.ids, config, out),
            None => log::warn!("Event for unknown manager {}: {:?}", id, event),
        }
    }

    /// Runs `f` against the session of `peer` and its manager's native central.
    pub(crate) fn with_session<T>(
        &mut self,
        id: ManagerId,
        peer: PeerId,
        f: impl FnOnce(&mut PeripheralSession<S::Central>, &mut S::Central) -> Result<T>,
    ) -> Result<T> {
        let manager = self
            .managers
            .get_mut(&id)
            .ok_or(BridgeError::UnknownManager(id))?;
        let (session, native) = manager.session_mut(peer)?;
        f(session, native)
    }
}
