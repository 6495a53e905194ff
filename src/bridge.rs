//! Async handle to the bridge's execution context.

use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast::{self, Sender};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::attribute::{Characteristic, Descriptor, Service};
use crate::config::BridgeConfig;
use crate::context::{BridgeContext, Command, PeerRequest, Reply};
use crate::error::{BridgeError, Result};
use crate::event::{BridgeEvent, Dispatch, EventHandler};
use crate::manager::{ManagerId, ManagerInfo, ManagerTable};
use crate::native::NativeStack;
use crate::registry::AttrId;
use crate::session::{PeerId, PeripheralInfo, PeripheralState};

pub type EventStream = Valved<Pin<Box<dyn Stream<Item = BridgeEvent> + Send>>>;

/// Handle to a running bridge.
///
/// Every request is queued onto the bridge's execution context and returns as
/// soon as it has been accepted or rejected. Outcomes arrive later as
/// [`BridgeEvent`]s. Dropping the handle shuts the bridge down.
pub struct Bridge<S: NativeStack> {
    commands: UnboundedSender<Command<S::Central>>,
    event_sender: Sender<BridgeEvent>,
    event_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
}

impl<S: NativeStack> Bridge<S> {
    /// Starts a bridge whose events are only available through
    /// [`event_stream`](Bridge::event_stream). Must be called within a tokio
    /// runtime.
    pub fn start(stack: S, config: BridgeConfig) -> Self {
        Self::spawn(stack, config, None)
    }

    /// Starts a bridge that also invokes `handler` for every event, on the
    /// bridge's execution context.
    pub fn with_handler(stack: S, config: BridgeConfig, handler: impl EventHandler) -> Self {
        Self::spawn(stack, config, Some(Box::new(handler)))
    }

    fn spawn(stack: S, config: BridgeConfig, handler: Option<Box<dyn EventHandler>>) -> Self {
        let (event_sender, _) = broadcast::channel(config.event_capacity);
        let (commands, receiver) = mpsc::unbounded_channel();

        let table = ManagerTable::new(stack, commands.clone());
        let dispatch = Dispatch::new(handler, event_sender.clone());
        let ctx = BridgeContext::new(config, table, dispatch, receiver);

        tokio::spawn(async move {
            ctx.listen().await;
        });

        Self {
            commands,
            event_sender,
            event_stream_stoppers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a new stream that receives every bridge event emitted from now on.
    pub fn event_stream(&self) -> EventStream {
        let receiver = self.event_sender.subscribe();

        let stream: Pin<Box<dyn Stream<Item = BridgeEvent> + Send>> =
            Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move {
                match x {
                    Ok(event) => Some(event),
                    Err(e) => {
                        log::warn!("Event stream lagged: {}", e);
                        None
                    }
                }
            }));

        let (trigger, stream) = Valved::new(stream);
        self.event_stream_stoppers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trigger);

        stream
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command<S::Central>) -> Result<T> {
        let (reply, response) = oneshot::channel();

        self.commands
            .send(command(reply))
            .map_err(|_| BridgeError::Closed)?;

        response.await.map_err(|_| BridgeError::Closed)?
    }

    async fn peer_request(&self, manager: ManagerId, peer: &str, request: PeerRequest) -> Result<()> {
        let peer = PeerId::from_str(peer)?;

        self.request(|reply| Command::Peer {
            manager,
            peer,
            request,
            reply,
        })
        .await
    }

    /// Allocates a new central manager, initially powered off and not scanning.
    pub async fn allocate_manager(&self) -> Result<ManagerId> {
        self.request(Command::Allocate).await
    }

    /// Destroys a manager, disconnecting and dropping all of its sessions.
    pub async fn destroy_manager(&self, manager: ManagerId) -> Result<()> {
        self.request(|reply| Command::Destroy { manager, reply })
            .await
    }

    pub async fn managers(&self) -> Result<Vec<ManagerId>> {
        let (reply, response) = oneshot::channel();

        self.commands
            .send(Command::Managers(reply))
            .map_err(|_| BridgeError::Closed)?;

        response.await.map_err(|_| BridgeError::Closed)
    }

    pub async fn manager_info(&self, manager: ManagerId) -> Result<ManagerInfo> {
        self.request(|reply| Command::ManagerInfo { manager, reply })
            .await
    }

    pub async fn is_scanning(&self, manager: ManagerId) -> Result<bool> {
        Ok(self.manager_info(manager).await?.scanning)
    }

    /// Starts scanning. With `allow_duplicates` off, each peer is reported at
    /// most once until the scan is stopped.
    pub async fn scan(&self, manager: ManagerId, allow_duplicates: bool) -> Result<()> {
        self.request(|reply| Command::Scan {
            manager,
            allow_duplicates,
            reply,
        })
        .await
    }

    pub async fn stop_scan(&self, manager: ManagerId) -> Result<()> {
        self.request(|reply| Command::StopScan { manager, reply })
            .await
    }

    pub async fn connect(&self, manager: ManagerId, peer: &str) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::Connect).await
    }

    pub async fn disconnect(&self, manager: ManagerId, peer: &str) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::Disconnect)
            .await
    }

    /// Drops the session of a disconnected peer along with its attribute tree.
    pub async fn forget(&self, manager: ManagerId, peer: &str) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::Forget).await
    }

    /// Negotiated ATT MTU of a connected peer.
    pub async fn att_mtu(&self, manager: ManagerId, peer: &str) -> Result<u16> {
        let peer = PeerId::from_str(peer)?;

        self.request(|reply| Command::AttMtu {
            manager,
            peer,
            reply,
        })
        .await
    }

    /// Discovers services, rebuilding the peer's whole attribute tree. An empty
    /// filter discovers every service.
    pub async fn discover_services(
        &self,
        manager: ManagerId,
        peer: &str,
        filter: &[Uuid],
    ) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::DiscoverServices(filter.to_vec()))
            .await
    }

    pub async fn discover_characteristics(
        &self,
        manager: ManagerId,
        peer: &str,
        service: AttrId,
        filter: &[Uuid],
    ) -> Result<()> {
        self.peer_request(
            manager,
            peer,
            PeerRequest::DiscoverCharacteristics {
                service,
                filter: filter.to_vec(),
            },
        )
        .await
    }

    pub async fn discover_descriptors(
        &self,
        manager: ManagerId,
        peer: &str,
        characteristic: AttrId,
    ) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::DiscoverDescriptors(characteristic))
            .await
    }

    pub async fn read_characteristic(
        &self,
        manager: ManagerId,
        peer: &str,
        characteristic: AttrId,
    ) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::ReadCharacteristic(characteristic))
            .await
    }

    /// Writes `value`. No event follows a write issued with `no_response`.
    pub async fn write_characteristic(
        &self,
        manager: ManagerId,
        peer: &str,
        characteristic: AttrId,
        value: &[u8],
        no_response: bool,
    ) -> Result<()> {
        self.peer_request(
            manager,
            peer,
            PeerRequest::WriteCharacteristic {
                characteristic,
                value: value.to_vec(),
                no_response,
            },
        )
        .await
    }

    pub async fn read_descriptor(
        &self,
        manager: ManagerId,
        peer: &str,
        descriptor: AttrId,
    ) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::ReadDescriptor(descriptor))
            .await
    }

    pub async fn write_descriptor(
        &self,
        manager: ManagerId,
        peer: &str,
        descriptor: AttrId,
        value: &[u8],
    ) -> Result<()> {
        self.peer_request(
            manager,
            peer,
            PeerRequest::WriteDescriptor {
                descriptor,
                value: value.to_vec(),
            },
        )
        .await
    }

    /// Enables notifications. Values then arrive as characteristic read events.
    pub async fn subscribe(
        &self,
        manager: ManagerId,
        peer: &str,
        characteristic: AttrId,
    ) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::Subscribe(characteristic))
            .await
    }

    pub async fn unsubscribe(
        &self,
        manager: ManagerId,
        peer: &str,
        characteristic: AttrId,
    ) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::Unsubscribe(characteristic))
            .await
    }

    pub async fn read_rssi(&self, manager: ManagerId, peer: &str) -> Result<()> {
        self.peer_request(manager, peer, PeerRequest::ReadRssi).await
    }

    /// Snapshot of a peer's session.
    pub async fn peripheral(&self, manager: ManagerId, peer: &str) -> Result<PeripheralInfo> {
        let peer = PeerId::from_str(peer)?;

        self.request(|reply| Command::PeripheralInfo {
            manager,
            peer,
            reply,
        })
        .await
    }

    pub async fn peripheral_state(&self, manager: ManagerId, peer: &str) -> Result<PeripheralState> {
        Ok(self.peripheral(manager, peer).await?.state)
    }

    pub async fn last_rssi(&self, manager: ManagerId, peer: &str) -> Result<Option<i16>> {
        Ok(self.peripheral(manager, peer).await?.rssi)
    }

    /// Services currently cached for a peer, in discovery order.
    pub async fn services(&self, manager: ManagerId, peer: &str) -> Result<Vec<Service>> {
        let peer = PeerId::from_str(peer)?;

        self.request(|reply| Command::Services {
            manager,
            peer,
            reply,
        })
        .await
    }

    pub async fn characteristics(
        &self,
        manager: ManagerId,
        peer: &str,
        service: AttrId,
    ) -> Result<Vec<Characteristic>> {
        let peer = PeerId::from_str(peer)?;

        self.request(|reply| Command::Characteristics {
            manager,
            peer,
            service,
            reply,
        })
        .await
    }

    pub async fn descriptors(
        &self,
        manager: ManagerId,
        peer: &str,
        characteristic: AttrId,
    ) -> Result<Vec<Descriptor>> {
        let peer = PeerId::from_str(peer)?;

        self.request(|reply| Command::Descriptors {
            manager,
            peer,
            characteristic,
            reply,
        })
        .await
    }

    /// Destroys every manager and waits for the execution context to stop.
    /// Open event streams end once the handle is gone, so teardown events are
    /// only guaranteed to reach an [`EventHandler`].
    pub async fn shutdown(self) {
        let (done, stopped) = oneshot::channel();

        if self.commands.send(Command::Shutdown(Some(done))).is_ok() {
            stopped.await.ok();
        }
    }
}

impl<S: NativeStack> Drop for Bridge<S> {
    fn drop(&mut self) {
        // Already gone if `shutdown` ran first.
        self.commands.send(Command::Shutdown(None)).ok();
        self.event_stream_stoppers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
