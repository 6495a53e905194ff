#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use blebridge::native::{
    NativeAttribute, NativeCentral, NativeCharacteristic, NativeEvent, NativeEvents, NativeResult,
    NativeStack,
};
use blebridge::{
    AttrId, Bridge, BridgeConfig, BridgeEvent, ByteView, Characteristic, Descriptor,
    DiscoveredPeripheral, EventHandler, ManagerId, NativeError, PeerId, Service, STATUS_OK,
};
use uuid::Uuid;

pub type FakeEvent = NativeEvent<FakeCentral>;

/// Native requests the bridge forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Scan(bool),
    StopScan,
    Connect(PeerId),
    CancelConnection(PeerId),
    DiscoverServices(PeerId, Vec<Uuid>),
    DiscoverCharacteristics(PeerId, u32),
    DiscoverDescriptors(PeerId, u32),
    ReadCharacteristic(PeerId, u32),
    WriteCharacteristic {
        peer: PeerId,
        handle: u32,
        value: Vec<u8>,
        no_response: bool,
    },
    ReadDescriptor(PeerId, u32),
    WriteDescriptor(PeerId, u32, Vec<u8>),
    Subscribe(PeerId, u32),
    Unsubscribe(PeerId, u32),
    ReadRssi(PeerId),
    Close,
}

#[derive(Default)]
pub struct FakeState {
    pub known: HashSet<PeerId>,
    pub calls: Vec<Call>,
    pub events: HashMap<ManagerId, NativeEvents<FakeCentral>>,
    pub refuse_connect: bool,
    pub mtu: Option<u16>,
}

#[derive(Clone, Default)]
pub struct FakeStack {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStack {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

impl NativeStack for FakeStack {
    type Central = FakeCentral;

    fn open(
        &mut self,
        manager: ManagerId,
        events: NativeEvents<FakeCentral>,
    ) -> Result<FakeCentral, NativeError> {
        self.state().events.insert(manager, events);

        Ok(FakeCentral {
            state: self.state.clone(),
        })
    }
}

pub struct FakeCentral {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCentral {
    fn record(&self, call: Call) -> NativeResult {
        self.state.lock().unwrap().calls.push(call);
        Ok(())
    }
}

impl NativeCentral for FakeCentral {
    type Peer = PeerId;
    type Service = u32;
    type Characteristic = u32;
    type Descriptor = u32;

    fn scan(&mut self, allow_duplicates: bool) {
        self.record(Call::Scan(allow_duplicates)).ok();
    }

    fn stop_scan(&mut self) {
        self.record(Call::StopScan).ok();
    }

    fn peripheral(&mut self, peer: &PeerId) -> Option<PeerId> {
        self.state.lock().unwrap().known.get(peer).copied()
    }

    fn connect(&mut self, peer: &PeerId) -> NativeResult {
        if self.state.lock().unwrap().refuse_connect {
            return Err(NativeError::PeerNotFound(*peer));
        }
        self.record(Call::Connect(*peer))
    }

    fn cancel_connection(&mut self, peer: &PeerId) -> NativeResult {
        self.record(Call::CancelConnection(*peer))
    }

    fn att_mtu(&self, _peer: &PeerId) -> Option<u16> {
        self.state.lock().unwrap().mtu
    }

    fn discover_services(&mut self, peer: &PeerId, filter: &[Uuid]) -> NativeResult {
        self.record(Call::DiscoverServices(*peer, filter.to_vec()))
    }

    fn discover_characteristics(&mut self, peer: &PeerId, service: &u32, _filter: &[Uuid]) -> NativeResult {
        self.record(Call::DiscoverCharacteristics(*peer, *service))
    }

    fn discover_descriptors(&mut self, peer: &PeerId, characteristic: &u32) -> NativeResult {
        self.record(Call::DiscoverDescriptors(*peer, *characteristic))
    }

    fn read_characteristic(&mut self, peer: &PeerId, characteristic: &u32) -> NativeResult {
        self.record(Call::ReadCharacteristic(*peer, *characteristic))
    }

    fn write_characteristic(
        &mut self,
        peer: &PeerId,
        characteristic: &u32,
        value: &[u8],
        no_response: bool,
    ) -> NativeResult {
        self.record(Call::WriteCharacteristic {
            peer: *peer,
            handle: *characteristic,
            value: value.to_vec(),
            no_response,
        })
    }

    fn read_descriptor(&mut self, peer: &PeerId, descriptor: &u32) -> NativeResult {
        self.record(Call::ReadDescriptor(*peer, *descriptor))
    }

    fn write_descriptor(&mut self, peer: &PeerId, descriptor: &u32, value: &[u8]) -> NativeResult {
        self.record(Call::WriteDescriptor(*peer, *descriptor, value.to_vec()))
    }

    fn subscribe(&mut self, peer: &PeerId, characteristic: &u32) -> NativeResult {
        self.record(Call::Subscribe(*peer, *characteristic))
    }

    fn unsubscribe(&mut self, peer: &PeerId, characteristic: &u32) -> NativeResult {
        self.record(Call::Unsubscribe(*peer, *characteristic))
    }

    fn read_rssi(&mut self, peer: &PeerId) -> NativeResult {
        self.record(Call::ReadRssi(*peer))
    }

    fn close(&mut self) {
        self.record(Call::Close).ok();
    }
}

/// Collects every event delivered to the handler callbacks.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<BridgeEvent>>>,
}

impl Recorder {
    fn push(&self, event: BridgeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventHandler for Recorder {
    fn on_state_changed(&mut self, manager: ManagerId, powered_on: bool, message: &str) {
        self.push(BridgeEvent::StateChanged {
            manager,
            powered_on,
            message: message.to_string(),
        });
    }

    fn on_peripheral_discovered(&mut self, manager: ManagerId, record: &DiscoveredPeripheral) {
        self.push(BridgeEvent::PeripheralDiscovered {
            manager,
            record: record.clone(),
        });
    }

    fn on_peripheral_connected(&mut self, manager: ManagerId, peer: &PeerId, status: i32) {
        self.push(BridgeEvent::PeripheralConnected {
            manager,
            peer: *peer,
            status,
        });
    }

    fn on_peripheral_disconnected(&mut self, manager: ManagerId, peer: &PeerId, reason: i32) {
        self.push(BridgeEvent::PeripheralDisconnected {
            manager,
            peer: *peer,
            reason,
        });
    }

    fn on_services_discovered(&mut self, manager: ManagerId, peer: &PeerId, status: i32, services: &[Service]) {
        self.push(BridgeEvent::ServicesDiscovered {
            manager,
            peer: *peer,
            status,
            services: services.to_vec(),
        });
    }

    fn on_characteristics_discovered(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        characteristics: &[Characteristic],
    ) {
        self.push(BridgeEvent::CharacteristicsDiscovered {
            manager,
            peer: *peer,
            status,
            characteristics: characteristics.to_vec(),
        });
    }

    fn on_descriptors_discovered(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        descriptors: &[Descriptor],
    ) {
        self.push(BridgeEvent::DescriptorsDiscovered {
            manager,
            peer: *peer,
            status,
            descriptors: descriptors.to_vec(),
        });
    }

    fn on_characteristic_read(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        uuid: &Uuid,
        value: ByteView<'_>,
    ) {
        self.push(BridgeEvent::CharacteristicRead {
            manager,
            peer: *peer,
            status,
            uuid: *uuid,
            value: value.to_vec(),
        });
    }

    fn on_characteristic_written(&mut self, manager: ManagerId, peer: &PeerId, status: i32, uuid: &Uuid) {
        self.push(BridgeEvent::CharacteristicWritten {
            manager,
            peer: *peer,
            status,
            uuid: *uuid,
        });
    }

    fn on_descriptor_read(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        uuid: &Uuid,
        value: ByteView<'_>,
    ) {
        self.push(BridgeEvent::DescriptorRead {
            manager,
            peer: *peer,
            status,
            uuid: *uuid,
            value: value.to_vec(),
        });
    }

    fn on_descriptor_written(&mut self, manager: ManagerId, peer: &PeerId, status: i32, uuid: &Uuid) {
        self.push(BridgeEvent::DescriptorWritten {
            manager,
            peer: *peer,
            status,
            uuid: *uuid,
        });
    }

    fn on_notification_state_changed(
        &mut self,
        manager: ManagerId,
        peer: &PeerId,
        status: i32,
        uuid: &Uuid,
        enabled: bool,
    ) {
        self.push(BridgeEvent::NotificationStateChanged {
            manager,
            peer: *peer,
            status,
            uuid: *uuid,
            enabled,
        });
    }

    fn on_rssi_read(&mut self, manager: ManagerId, peer: &PeerId, status: i32, rssi: i16) {
        self.push(BridgeEvent::RssiRead {
            manager,
            peer: *peer,
            status,
            rssi,
        });
    }
}

pub fn peer(n: u128) -> PeerId {
    PeerId::from_uuid(Uuid::from_u128(n))
}

pub fn uuid16(short: u16) -> Uuid {
    btleplug::api::bleuuid::uuid_from_u16(short)
}

pub fn service(handle: u32, short: u16) -> NativeAttribute<u32> {
    NativeAttribute {
        handle,
        uuid: uuid16(short),
    }
}

pub fn characteristic(handle: u32, short: u16, properties: u8) -> NativeCharacteristic<u32> {
    NativeCharacteristic {
        handle,
        uuid: uuid16(short),
        properties,
    }
}

pub fn descriptor(handle: u32, short: u16) -> NativeAttribute<u32> {
    NativeAttribute {
        handle,
        uuid: uuid16(short),
    }
}

pub fn advertisement(peer: PeerId, rssi: i16) -> FakeEvent {
    NativeEvent::PeripheralDiscovered(DiscoveredPeripheral {
        peer_id: peer,
        rssi,
        local_name: Some("fake".into()),
        power_level: blebridge::POWER_LEVEL_UNKNOWN,
        connectable: true,
        manufacturer_data: None,
        service_uuids: Vec::new(),
        service_data: Vec::new(),
    })
}

/// A bridge over [`FakeStack`] with a recording handler.
pub struct Harness {
    pub bridge: Bridge<FakeStack>,
    pub stack: FakeStack,
    recorder: Recorder,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let stack = FakeStack::default();
        let recorder = Recorder::default();
        let bridge = Bridge::with_handler(stack.clone(), config, recorder.clone());

        Self {
            bridge,
            stack,
            recorder,
        }
    }

    pub fn know(&self, peer: PeerId) {
        self.stack.state().known.insert(peer);
    }

    /// Delivers `event` as if the native stack of `manager` produced it.
    pub fn post(&self, manager: ManagerId, event: FakeEvent) {
        let events = self.stack.state().events.get(&manager).cloned().unwrap();
        assert!(events.post(event));
    }

    /// Waits until everything queued so far has been handled.
    pub async fn settle(&self) {
        self.bridge.managers().await.unwrap();
    }

    pub async fn post_and_settle(&self, manager: ManagerId, event: FakeEvent) {
        self.post(manager, event);
        self.settle().await;
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.recorder.events.lock().unwrap().clone()
    }

    pub fn take_events(&self) -> Vec<BridgeEvent> {
        std::mem::take(&mut *self.recorder.events.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.stack.state().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.stack.state().calls)
    }

    /// Allocates a manager with `peer` known and connected. Clears the log.
    pub async fn connected(&self, peer: PeerId) -> ManagerId {
        self.know(peer);
        let manager = self.bridge.allocate_manager().await.unwrap();

        self.bridge.connect(manager, &peer.to_string()).await.unwrap();
        self.post_and_settle(
            manager,
            NativeEvent::Connected {
                peer,
                status: STATUS_OK,
            },
        )
        .await;

        self.take_events();
        self.take_calls();
        manager
    }

    /// Discovers one service with the given characteristics on a connected
    /// peer and returns their ids. Clears the log.
    pub async fn with_characteristics(
        &self,
        manager: ManagerId,
        peer: PeerId,
        characteristics: Vec<NativeCharacteristic<u32>>,
    ) -> (AttrId, Vec<AttrId>) {
        let peer_str = peer.to_string();

        self.bridge.discover_services(manager, &peer_str, &[]).await.unwrap();
        self.post_and_settle(
            manager,
            NativeEvent::ServicesDiscovered {
                peer,
                status: STATUS_OK,
                services: vec![service(1, 0x180F)],
            },
        )
        .await;
        let services = self.bridge.services(manager, &peer_str).await.unwrap();

        self.bridge
            .discover_characteristics(manager, &peer_str, services[0].id, &[])
            .await
            .unwrap();
        self.post_and_settle(
            manager,
            NativeEvent::CharacteristicsDiscovered {
                peer,
                status: STATUS_OK,
                service: 1,
                characteristics,
            },
        )
        .await;
        let found = self
            .bridge
            .characteristics(manager, &peer_str, services[0].id)
            .await
            .unwrap();

        self.take_events();
        self.take_calls();
        (services[0].id, found.into_iter().map(|c| c.id).collect())
    }
}
