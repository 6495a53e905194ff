//! [`NativeStack`] over the host adapter, through `btleplug`.
//!
//! btleplug requests are async; each one runs on its own task and reports back
//! through [`NativeEvents`], the same way a delegate-based host stack would.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Descriptor, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use btleplug::Error;
use futures::StreamExt;
use stream_cancel::{Trigger, Tripwire};
use uuid::Uuid;

use crate::error::NativeError;
use crate::event::{DiscoveredPeripheral, ServiceData, POWER_LEVEL_UNKNOWN, STATUS_OK};
use crate::manager::ManagerId;
use crate::native::{
    NativeAttribute, NativeCentral, NativeCharacteristic, NativeEvent, NativeEvents, NativeResult,
    NativeStack,
};
use crate::session::PeerId;

/// Namespace for peer identities derived from platform peripheral ids.
const PEER_NAMESPACE: Uuid = Uuid::from_u128(0x6c1b_42a7_0f4e_4d1c_9a53_2be8_d5a0_c317);

/// Status reported for a failed btleplug request.
pub fn error_status(err: &Error) -> i32 {
    match err {
        Error::PermissionDenied => 1,
        Error::DeviceNotFound => 2,
        Error::NotConnected => 3,
        Error::NotSupported(_) => 4,
        Error::TimedOut(_) => 5,
        Error::NoSuchCharacteristic | Error::UnexpectedCharacteristic => 6,
        _ => 255,
    }
}

fn status_of<T>(result: &Result<T, Error>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => error_status(e),
    }
}

/// Peer identity of a platform peripheral. Stable for the process lifetime.
pub fn peer_id(id: &PeripheralId) -> PeerId {
    PeerId::from_uuid(Uuid::new_v5(&PEER_NAMESPACE, format!("{:?}", id).as_bytes()))
}

fn discovered_peripheral(peer_id: PeerId, props: PeripheralProperties) -> DiscoveredPeripheral {
    let manufacturer_data = {
        let mut entries: Vec<_> = props.manufacturer_data.into_iter().collect();
        entries.sort_by_key(|(company, _)| *company);
        entries.into_iter().next().map(|(company, data)| {
            let mut payload = company.to_le_bytes().to_vec();
            payload.extend(data);
            payload
        })
    };

    let mut service_data: Vec<_> = props
        .service_data
        .into_iter()
        .map(|(uuid, data)| ServiceData { uuid, data })
        .collect();
    service_data.sort_by_key(|entry| entry.uuid);

    DiscoveredPeripheral {
        peer_id,
        rssi: props.rssi.unwrap_or(POWER_LEVEL_UNKNOWN),
        local_name: props.local_name,
        power_level: props.tx_power_level.unwrap_or(POWER_LEVEL_UNKNOWN),
        // btleplug does not report the connectable flag of an advertisement.
        connectable: true,
        manufacturer_data,
        service_uuids: props.services,
        service_data,
    }
}

fn matches_filter(filter: &[Uuid], uuid: &Uuid) -> bool {
    filter.is_empty() || filter.contains(uuid)
}

fn state_changed(state: CentralState) -> NativeEvent<BtleplugCentral> {
    let (powered_on, message) = match state {
        CentralState::PoweredOn => (true, "powered on"),
        CentralState::PoweredOff => (false, "powered off"),
        CentralState::Unknown => (false, "state unknown"),
    };

    NativeEvent::StateChanged {
        powered_on,
        message: message.into(),
    }
}

/// Posts notification values as unsolicited reads until the link drops.
async fn forward_notifications(
    events: NativeEvents<BtleplugCentral>,
    tripwire: Tripwire,
    link: Tripwire,
    peer: PeerId,
    peripheral: Peripheral,
) {
    let notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("No notifications from {}: {}", peer, e);
            return;
        }
    };

    let notifications = stream_cancel::StreamExt::take_until_if(notifications, tripwire);
    let mut notifications = Box::pin(stream_cancel::StreamExt::take_until_if(notifications, link));

    while let Some(notification) = notifications.next().await {
        let posted = events.post(NativeEvent::CharacteristicRead {
            peer,
            status: STATUS_OK,
            uuid: notification.uuid,
            value: notification.value,
        });
        if !posted {
            break;
        }
    }

    log::trace!("Notification forwarder of {} ended", peer);
}

type Peripherals = Arc<Mutex<HashMap<PeerId, Peripheral>>>;

/// Notification forwarder of each live connection. Dropping a trigger stops
/// its forwarder.
#[derive(Clone, Default)]
struct Links(Arc<Mutex<HashMap<PeerId, Trigger>>>);

impl Links {
    /// Starts a new link to `peer`, ending the forwarder of any previous one.
    fn open(&self, peer: PeerId) -> Tripwire {
        let (trigger, tripwire) = Tripwire::new();
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, trigger);
        tripwire
    }

    fn close(&self, peer: &PeerId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }
}

/// Radio scan shared by every manager on one adapter.
#[derive(Clone, Default)]
struct ScanCount(Arc<AtomicUsize>);

impl ScanCount {
    /// Returns `true` for the first scanner, which starts the radio scan.
    fn acquire(&self) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst) == 0
    }

    /// Returns `true` for the last scanner, which stops the radio scan.
    fn release(&self) -> bool {
        self.0.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

/// Host BLE adapter. Every manager opened on it shares the adapter.
pub struct BtleplugStack {
    _manager: Manager,
    adapter: Adapter,
    scans: ScanCount,
}

impl BtleplugStack {
    /// Uses the first adapter found.
    pub async fn new() -> Result<Self, Error> {
        Self::with_adapter_index(0).await
    }

    /// Index of bluetooth adapter to use
    pub async fn with_adapter_index(index: usize) -> Result<Self, Error> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if index >= adapters.len() {
            return Err(Error::DeviceNotFound);
        }

        let adapter = adapters.swap_remove(index);

        log::trace!("Using adapter: {:?}", adapter);

        Ok(Self {
            _manager: manager,
            adapter,
            scans: ScanCount::default(),
        })
    }
}

impl NativeStack for BtleplugStack {
    type Central = BtleplugCentral;

    fn open(
        &mut self,
        manager: ManagerId,
        events: NativeEvents<BtleplugCentral>,
    ) -> Result<BtleplugCentral, NativeError> {
        let (stopper, tripwire) = Tripwire::new();
        let peripherals = Peripherals::default();
        let links = Links::default();

        let ctx = AdapterContext {
            adapter: self.adapter.clone(),
            events: events.clone(),
            peripherals: peripherals.clone(),
            links: links.clone(),
        };
        tokio::spawn(ctx.listen(tripwire.clone()));

        log::debug!("Opened adapter for manager {}", manager);

        Ok(BtleplugCentral {
            adapter: self.adapter.clone(),
            events,
            peripherals,
            links,
            scans: self.scans.clone(),
            scanning: false,
            tripwire,
            stopper: Some(stopper),
        })
    }
}

/// Forwards adapter events of one manager.
struct AdapterContext {
    adapter: Adapter,
    events: NativeEvents<BtleplugCentral>,
    peripherals: Peripherals,
    links: Links,
}

impl AdapterContext {
    async fn listen(self, tripwire: Tripwire) {
        let stream = match self.adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Could not listen to adapter events: {}", e);
                self.events.post(NativeEvent::StateChanged {
                    powered_on: false,
                    message: e.to_string(),
                });
                return;
            }
        };

        match self.adapter.adapter_state().await {
            Ok(state) => {
                self.events.post(state_changed(state));
            }
            Err(e) => {
                log::debug!("Adapter state unavailable, assuming powered on: {}", e);
                self.events.post(NativeEvent::StateChanged {
                    powered_on: true,
                    message: "adapter ready".into(),
                });
            }
        }

        let mut stream = Box::pin(stream_cancel::StreamExt::take_until_if(stream, tripwire));

        while let Some(event) = stream.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    self.on_device_advertised(id).await;
                }
                CentralEvent::DeviceDisconnected(id) => {
                    log::trace!("Device disconnected: {:?}", id);
                    let peer = peer_id(&id);
                    self.links.close(&peer);
                    self.events.post(NativeEvent::Disconnected {
                        peer,
                        reason: STATUS_OK,
                    });
                }
                CentralEvent::StateUpdate(state) => {
                    log::trace!("Adapter state: {:?}", state);
                    self.events.post(state_changed(state));
                }
                _ => {}
            }
        }

        log::debug!("Adapter listener of manager {} stopped", self.events.manager());
    }

    async fn on_device_advertised(&self, id: PeripheralId) {
        let Ok(peripheral) = self.adapter.peripheral(&id).await else {
            return;
        };

        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            _ => return,
        };

        let peer = peer_id(&id);
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, peripheral);

        self.events
            .post(NativeEvent::PeripheralDiscovered(discovered_peripheral(peer, props)));
    }
}

/// One manager's view of the host adapter.
pub struct BtleplugCentral {
    adapter: Adapter,
    events: NativeEvents<BtleplugCentral>,
    peripherals: Peripherals,
    links: Links,
    scans: ScanCount,
    scanning: bool,
    tripwire: Tripwire,
    stopper: Option<Trigger>,
}

impl BtleplugCentral {
    fn run<F>(&self, request: F)
    where
        F: Future<Output = Option<NativeEvent<BtleplugCentral>>> + Send + 'static,
    {
        let events = self.events.clone();

        tokio::spawn(async move {
            if let Some(event) = request.await {
                events.post(event);
            }
        });
    }
}

impl NativeCentral for BtleplugCentral {
    type Peer = (PeerId, Peripheral);
    type Service = Service;
    type Characteristic = Characteristic;
    type Descriptor = Descriptor;

    fn scan(&mut self, _allow_duplicates: bool) {
        // Duplicate filtering happens in the manager.
        if self.scanning {
            return;
        }
        self.scanning = true;
        if !self.scans.acquire() {
            log::trace!("Radio already scanning for another manager");
            return;
        }

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                log::error!("Could not start scan: {}", e);
            }
        });
    }

    fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if !self.scans.release() {
            log::trace!("Radio still scanning for another manager");
            return;
        }

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                log::error!("Could not stop scan: {}", e);
            }
        });
    }

    fn peripheral(&mut self, peer: &PeerId) -> Option<Self::Peer> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|peripheral| (*peer, peripheral.clone()))
    }

    fn connect(&mut self, (peer, peripheral): &Self::Peer) -> NativeResult {
        let (peer, peripheral) = (*peer, peripheral.clone());
        let events = self.events.clone();
        let tripwire = self.tripwire.clone();
        let link = self.links.open(peer);

        tokio::spawn(async move {
            let status = status_of(&peripheral.connect().await);
            events.post(NativeEvent::Connected { peer, status });

            if status == STATUS_OK {
                forward_notifications(events, tripwire, link, peer, peripheral).await;
            }
        });

        Ok(())
    }

    fn cancel_connection(&mut self, (peer, peripheral): &Self::Peer) -> NativeResult {
        let (peer, peripheral) = (*peer, peripheral.clone());
        self.links.close(&peer);

        self.run(async move {
            if let Err(e) = peripheral.disconnect().await {
                log::warn!("Disconnect from {} failed: {}", peer, e);
            }
            Some(NativeEvent::Disconnected {
                peer,
                reason: STATUS_OK,
            })
        });

        Ok(())
    }

    fn att_mtu(&self, _peer: &Self::Peer) -> Option<u16> {
        None
    }

    fn discover_services(&mut self, (peer, peripheral): &Self::Peer, filter: &[Uuid]) -> NativeResult {
        let (peer, peripheral, filter) = (*peer, peripheral.clone(), filter.to_vec());

        self.run(async move {
            let result = peripheral.discover_services().await;
            let services = match result {
                Ok(()) => peripheral
                    .services()
                    .into_iter()
                    .filter(|service| matches_filter(&filter, &service.uuid))
                    .map(|service| NativeAttribute {
                        uuid: service.uuid,
                        handle: service,
                    })
                    .collect(),
                Err(_) => Vec::new(),
            };

            Some(NativeEvent::ServicesDiscovered {
                peer,
                status: status_of(&result),
                services,
            })
        });

        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        (peer, _): &Self::Peer,
        service: &Service,
        filter: &[Uuid],
    ) -> NativeResult {
        // btleplug discovers the whole tree along with the services.
        let characteristics = service
            .characteristics
            .iter()
            .filter(|characteristic| matches_filter(filter, &characteristic.uuid))
            .map(|characteristic| NativeCharacteristic {
                handle: characteristic.clone(),
                uuid: characteristic.uuid,
                properties: characteristic.properties.bits(),
            })
            .collect();

        self.events.post(NativeEvent::CharacteristicsDiscovered {
            peer: *peer,
            status: STATUS_OK,
            service: service.clone(),
            characteristics,
        });

        Ok(())
    }

    fn discover_descriptors(
        &mut self,
        (peer, _): &Self::Peer,
        characteristic: &Characteristic,
    ) -> NativeResult {
        let descriptors = characteristic
            .descriptors
            .iter()
            .map(|descriptor| NativeAttribute {
                handle: descriptor.clone(),
                uuid: descriptor.uuid,
            })
            .collect();

        self.events.post(NativeEvent::DescriptorsDiscovered {
            peer: *peer,
            status: STATUS_OK,
            characteristic: characteristic.clone(),
            descriptors,
        });

        Ok(())
    }

    fn read_characteristic(
        &mut self,
        (peer, peripheral): &Self::Peer,
        characteristic: &Characteristic,
    ) -> NativeResult {
        let (peer, peripheral, characteristic) = (*peer, peripheral.clone(), characteristic.clone());

        self.run(async move {
            let result = peripheral.read(&characteristic).await;

            Some(NativeEvent::CharacteristicRead {
                peer,
                status: status_of(&result),
                uuid: characteristic.uuid,
                value: result.unwrap_or_default(),
            })
        });

        Ok(())
    }

    fn write_characteristic(
        &mut self,
        (peer, peripheral): &Self::Peer,
        characteristic: &Characteristic,
        value: &[u8],
        no_response: bool,
    ) -> NativeResult {
        let (peer, peripheral, characteristic) = (*peer, peripheral.clone(), characteristic.clone());
        let value = value.to_vec();
        let write_type = if no_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        self.run(async move {
            let result = peripheral.write(&characteristic, &value, write_type).await;

            if no_response {
                if let Err(e) = result {
                    log::warn!("Write without response to {} failed: {}", peer, e);
                }
                return None;
            }

            Some(NativeEvent::CharacteristicWritten {
                peer,
                status: status_of(&result),
                uuid: characteristic.uuid,
            })
        });

        Ok(())
    }

    fn read_descriptor(&mut self, (peer, peripheral): &Self::Peer, descriptor: &Descriptor) -> NativeResult {
        let (peer, peripheral, descriptor) = (*peer, peripheral.clone(), descriptor.clone());

        self.run(async move {
            let result = peripheral.read_descriptor(&descriptor).await;

            Some(NativeEvent::DescriptorRead {
                peer,
                status: status_of(&result),
                uuid: descriptor.uuid,
                value: result.unwrap_or_default(),
            })
        });

        Ok(())
    }

    fn write_descriptor(
        &mut self,
        (peer, peripheral): &Self::Peer,
        descriptor: &Descriptor,
        value: &[u8],
    ) -> NativeResult {
        let (peer, peripheral, descriptor) = (*peer, peripheral.clone(), descriptor.clone());
        let value = value.to_vec();

        self.run(async move {
            let result = peripheral.write_descriptor(&descriptor, &value).await;

            Some(NativeEvent::DescriptorWritten {
                peer,
                status: status_of(&result),
                uuid: descriptor.uuid,
            })
        });

        Ok(())
    }

    fn subscribe(&mut self, (peer, peripheral): &Self::Peer, characteristic: &Characteristic) -> NativeResult {
        let (peer, peripheral, characteristic) = (*peer, peripheral.clone(), characteristic.clone());

        self.run(async move {
            let result = peripheral.subscribe(&characteristic).await;

            Some(NativeEvent::NotificationStateChanged {
                peer,
                status: status_of(&result),
                uuid: characteristic.uuid,
                enabled: result.is_ok(),
            })
        });

        Ok(())
    }

    fn unsubscribe(
        &mut self,
        (peer, peripheral): &Self::Peer,
        characteristic: &Characteristic,
    ) -> NativeResult {
        let (peer, peripheral, characteristic) = (*peer, peripheral.clone(), characteristic.clone());

        self.run(async move {
            let result = peripheral.unsubscribe(&characteristic).await;

            Some(NativeEvent::NotificationStateChanged {
                peer,
                status: status_of(&result),
                uuid: characteristic.uuid,
                enabled: false,
            })
        });

        Ok(())
    }

    fn read_rssi(&mut self, (peer, peripheral): &Self::Peer) -> NativeResult {
        let (peer, peripheral) = (*peer, peripheral.clone());

        self.run(async move {
            let result = peripheral.properties().await;
            let rssi = match &result {
                Ok(Some(props)) => props.rssi.unwrap_or(POWER_LEVEL_UNKNOWN),
                _ => POWER_LEVEL_UNKNOWN,
            };

            Some(NativeEvent::RssiRead {
                peer,
                status: status_of(&result),
                rssi,
            })
        });

        Ok(())
    }

    fn close(&mut self) {
        self.stop_scan();
        self.stopper.take();
        log::debug!("Closed adapter of manager {}", self.events.manager());
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if self.scanning {
            self.scanning = false;
            self.scans.release();
        }
        self.stopper.take();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use btleplug::api::CharPropFlags;
    use futures::FutureExt;

    use super::*;
    use crate::common::{characteristics, services};
    use crate::registry::{IdAllocator, Registry};

    #[test]
    fn manufacturer_data_is_prefixed_with_company_id() {
        let peer = PeerId::from_uuid(Uuid::nil());
        let mut props = PeripheralProperties::default();
        props.manufacturer_data.insert(0x004C, vec![0x02, 0x15]);

        let record = discovered_peripheral(peer, props);

        assert_eq!(record.manufacturer_data, Some(vec![0x4C, 0x00, 0x02, 0x15]));
        assert_eq!(record.power_level, POWER_LEVEL_UNKNOWN);
        assert_eq!(record.rssi, POWER_LEVEL_UNKNOWN);
        assert!(record.connectable);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let uuid = Uuid::from_u128(1);

        assert!(matches_filter(&[], &uuid));
        assert!(matches_filter(&[uuid], &uuid));
        assert!(!matches_filter(&[Uuid::from_u128(2)], &uuid));
    }

    #[test]
    fn btleplug_characteristics_mint_stable_ids() {
        let battery_level = Characteristic {
            uuid: characteristics::BATTERY_LEVEL,
            service_uuid: services::BATTERY,
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::new(),
        };
        let mut ids = IdAllocator::new();
        let mut registry: Registry<Characteristic> = Registry::new();

        let first = registry.mint(&mut ids, battery_level.clone(), ());
        let second = registry.mint(&mut ids, battery_level.clone(), ());

        assert_eq!(first, second);
        assert_eq!(registry.resolve(first), Ok(&battery_level));
    }

    #[test]
    fn adapter_states_map_to_power() {
        let powered = |state| match state_changed(state) {
            NativeEvent::StateChanged { powered_on, .. } => powered_on,
            other => panic!("unexpected {:?}", other),
        };

        assert!(powered(CentralState::PoweredOn));
        assert!(!powered(CentralState::PoweredOff));
        assert!(!powered(CentralState::Unknown));
    }

    #[test]
    fn reconnecting_ends_the_previous_forwarder() {
        let links = Links::default();
        let peer = PeerId::from_uuid(Uuid::from_u128(1));

        let first = links.open(peer);
        let second = links.open(peer);

        assert_eq!(first.now_or_never(), Some(true));
        assert_eq!(second.clone().now_or_never(), None);

        links.close(&peer);
        assert_eq!(second.now_or_never(), Some(true));
    }

    #[test]
    fn radio_scan_runs_while_any_manager_scans() {
        let scans = ScanCount::default();

        assert!(scans.acquire());
        assert!(!scans.acquire());
        assert!(!scans.release());
        assert!(scans.release());
        assert!(scans.acquire());
    }

    #[test]
    fn errors_map_to_positive_statuses() {
        assert_eq!(error_status(&Error::NotConnected), 3);
        assert!(error_status(&Error::RuntimeError("boom".into())) > 0);
    }
}
