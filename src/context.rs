//! The single execution context that owns all bridge state.
//!
//! Caller requests and native completions share one FIFO queue drained by one
//! task, so nothing inside the bridge needs a lock.

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::attribute::{Characteristic, Descriptor, Service};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::event::Dispatch;
use crate::manager::{ManagerId, ManagerInfo, ManagerTable};
use crate::native::{NativeCentral, NativeEvent, NativeStack};
use crate::registry::AttrId;
use crate::session::{PeerId, PeripheralInfo};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Per-peer operation requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerRequest {
    Connect,
    Disconnect,
    Forget,
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics {
        service: AttrId,
        filter: Vec<Uuid>,
    },
    DiscoverDescriptors(AttrId),
    ReadCharacteristic(AttrId),
    WriteCharacteristic {
        characteristic: AttrId,
        value: Vec<u8>,
        no_response: bool,
    },
    ReadDescriptor(AttrId),
    WriteDescriptor {
        descriptor: AttrId,
        value: Vec<u8>,
    },
    Subscribe(AttrId),
    Unsubscribe(AttrId),
    ReadRssi,
}

pub(crate) enum Command<C: NativeCentral> {
    Allocate(Reply<ManagerId>),
    Destroy {
        manager: ManagerId,
        reply: Reply<()>,
    },
    Managers(oneshot::Sender<Vec<ManagerId>>),
    ManagerInfo {
        manager: ManagerId,
        reply: Reply<ManagerInfo>,
    },
    Scan {
        manager: ManagerId,
        allow_duplicates: bool,
        reply: Reply<()>,
    },
    StopScan {
        manager: ManagerId,
        reply: Reply<()>,
    },
    Peer {
        manager: ManagerId,
        peer: PeerId,
        request: PeerRequest,
        reply: Reply<()>,
    },
    AttMtu {
        manager: ManagerId,
        peer: PeerId,
        reply: Reply<u16>,
    },
    PeripheralInfo {
        manager: ManagerId,
        peer: PeerId,
        reply: Reply<PeripheralInfo>,
    },
    Services {
        manager: ManagerId,
        peer: PeerId,
        reply: Reply<Vec<Service>>,
    },
    Characteristics {
        manager: ManagerId,
        peer: PeerId,
        service: AttrId,
        reply: Reply<Vec<Characteristic>>,
    },
    Descriptors {
        manager: ManagerId,
        peer: PeerId,
        characteristic: AttrId,
        reply: Reply<Vec<Descriptor>>,
    },
    Native {
        manager: ManagerId,
        event: NativeEvent<C>,
    },
    Shutdown(Option<oneshot::Sender<()>>),
}

pub(crate) struct BridgeContext<S: NativeStack> {
    config: BridgeConfig,
    table: ManagerTable<S>,
    dispatch: Dispatch,
    commands: UnboundedReceiver<Command<S::Central>>,
}

impl<S: NativeStack> BridgeContext<S> {
    pub(crate) fn new(
        config: BridgeConfig,
        table: ManagerTable<S>,
        dispatch: Dispatch,
        commands: UnboundedReceiver<Command<S::Central>>,
    ) -> Self {
        Self {
            config,
            table,
            dispatch,
            commands,
        }
    }

    pub(crate) async fn listen(mut self) {
        log::info!("Bridge context started");

        while let Some(command) = self.commands.recv().await {
            if let Command::Shutdown(done) = command {
                self.table.destroy_all(&mut self.dispatch);
                if let Some(done) = done {
                    done.send(()).ok();
                }
                break;
            }

            self.handle(command);
        }

        log::info!("Bridge context stopped");
    }

    fn handle(&mut self, command: Command<S::Central>) {
        match command {
            Command::Allocate(reply) => {
                reply.send(self.table.allocate()).ok();
            }
            Command::Destroy { manager, reply } => {
                reply
                    .send(self.table.destroy(manager, &mut self.dispatch))
                    .ok();
            }
            Command::Managers(reply) => {
                reply.send(self.table.ids()).ok();
            }
            Command::ManagerInfo { manager, reply } => {
                reply
                    .send(self.table.get(manager).map(|m| m.info()))
                    .ok();
            }
            Command::Scan {
                manager,
                allow_duplicates,
                reply,
            } => {
                let result = self
                    .table
                    .get_mut(manager)
                    .and_then(|m| m.scan(allow_duplicates));
                reply.send(result).ok();
            }
            Command::StopScan { manager, reply } => {
                let result = self.table.get_mut(manager).map(|m| m.stop_scan());
                reply.send(result).ok();
            }
            Command::Peer {
                manager,
                peer,
                request,
                reply,
            } => {
                let result = self.peer_request(manager, peer, request);
                if let Err(e) = &result {
                    log::debug!("Rejected request for {} on manager {}: {}", peer, manager, e);
                }
                reply.send(result).ok();
            }
            Command::AttMtu {
                manager,
                peer,
                reply,
            } => {
                let result = self
                    .table
                    .with_session(manager, peer, |session, native| session.att_mtu(native));
                reply.send(result).ok();
            }
            Command::PeripheralInfo {
                manager,
                peer,
                reply,
            } => {
                let result = self
                    .table
                    .get(manager)
                    .and_then(|m| m.session(peer))
                    .map(|session| session.info());
                reply.send(result).ok();
            }
            Command::Services {
                manager,
                peer,
                reply,
            } => {
                let result = self
                    .table
                    .get(manager)
                    .and_then(|m| m.session(peer))
                    .map(|session| session.tree().services());
                reply.send(result).ok();
            }
            Command::Characteristics {
                manager,
                peer,
                service,
                reply,
            } => {
                let result = self
                    .table
                    .get(manager)
                    .and_then(|m| m.session(peer))
                    .and_then(|session| session.tree().characteristics(service).map_err(Into::into));
                reply.send(result).ok();
            }
            Command::Descriptors {
                manager,
                peer,
                characteristic,
                reply,
            } => {
                let result = self
                    .table
                    .get(manager)
                    .and_then(|m| m.session(peer))
                    .and_then(|session| session.tree().descriptors(characteristic).map_err(Into::into));
                reply.send(result).ok();
            }
            Command::Native { manager, event } => {
                self.table
                    .on_native(manager, event, &self.config, &mut self.dispatch);
            }
            Command::Shutdown(_) => {}
        }
    }

    fn peer_request(&mut self, manager: ManagerId, peer: PeerId, request: PeerRequest) -> Result<()> {
        if request == PeerRequest::Forget {
            return self.table.get_mut(manager)?.forget(peer);
        }

        self.table
            .with_session(manager, peer, |session, native| match request {
                PeerRequest::Connect => session.connect(native),
                PeerRequest::Disconnect => session.disconnect(native),
                PeerRequest::DiscoverServices(filter) => session.discover_services(native, &filter),
                PeerRequest::DiscoverCharacteristics { service, filter } => {
                    session.discover_characteristics(native, service, &filter)
                }
                PeerRequest::DiscoverDescriptors(characteristic) => {
                    session.discover_descriptors(native, characteristic)
                }
                PeerRequest::ReadCharacteristic(characteristic) => {
                    session.read_characteristic(native, characteristic)
                }
                PeerRequest::WriteCharacteristic {
                    characteristic,
                    value,
                    no_response,
                } => session.write_characteristic(native, characteristic, &value, no_response),
                PeerRequest::ReadDescriptor(descriptor) => session.read_descriptor(native, descriptor),
                PeerRequest::WriteDescriptor { descriptor, value } => {
                    session.write_descriptor(native, descriptor, &value)
                }
                PeerRequest::Subscribe(characteristic) => {
                    session.set_notify(native, characteristic, true)
                }
                PeerRequest::Unsubscribe(characteristic) => {
                    session.set_notify(native, characteristic, false)
                }
                PeerRequest::ReadRssi => session.read_rssi(native),
                PeerRequest::Forget => Ok(()),
            })
    }
}
