//! In-memory links between transports in one process.
//!
//! Each [`LoopbackNode`] bundles a transport, its [`LoopbackLink`] and a
//! [`LinkTable`]. [`LoopbackNode::connect`] wires a client/server pair the
//! way a GATT connection would: the client sees a write-capable link to the
//! server, the server sees a subscribed link back to the client. Bytes for
//! each direction travel through their own delivery task so per-link order
//! is preserved, and every accepted write is followed by a completion.
//!
//! Failure injection (`reject_writes`, `fail_completions`,
//! `drop_completions`) drives the retry and watchdog paths in tests.

use crate::config::TransportConfig;
use crate::error::{LinkError, Result};
use crate::link::{Link, LinkAddress, LinkInfo, LinkTable};
use crate::progress::TransportEvent;
use crate::transport::MeshTransport;
use dashmap::DashMap;
use gattmesh_core::PeerId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;

struct Delivery {
    /// None when the write is made to fail
    bytes: Option<Vec<u8>>,
    /// Completion to report back, None for notifications
    completion: Option<bool>,
}

/// In-memory [`Link`] implementation
#[derive(Default)]
pub struct LoopbackLink {
    local: OnceLock<Weak<MeshTransport>>,
    routes: DashMap<LinkAddress, mpsc::UnboundedSender<Delivery>>,
    reject_next: AtomicUsize,
    fail_next: AtomicUsize,
    drop_completions: AtomicBool,
    writes: AtomicUsize,
    notifies: AtomicUsize,
}

impl LoopbackLink {
    /// Create a link with no routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the transport that receives this link's completions
    pub fn bind(&self, transport: &Arc<MeshTransport>) {
        let _ = self.local.set(Arc::downgrade(transport));
    }

    fn add_route(
        &self,
        address: LinkAddress,
        remote: Weak<MeshTransport>,
        inbound_address: LinkAddress,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let local = self.local.get().cloned().unwrap_or_default();
        let completion_address = address.clone();

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if let (Some(bytes), Some(remote)) = (&delivery.bytes, remote.upgrade()) {
                    remote.on_inbound(&inbound_address, bytes);
                }
                if let (Some(success), Some(local)) = (delivery.completion, local.upgrade()) {
                    local.on_write_completed(&completion_address, success);
                }
            }
        });

        self.routes.insert(address, tx);
    }

    fn remove_route(&self, address: &LinkAddress) {
        self.routes.remove(address);
    }

    /// Reject the next `n` writes synchronously with [`LinkError::Busy`]
    pub fn reject_writes(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Report failure for the next `n` write completions
    pub fn fail_completions(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Swallow write completions entirely
    pub fn drop_completions(&self, drop: bool) {
        self.drop_completions.store(drop, Ordering::SeqCst);
    }

    /// Writes accepted so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Notifications accepted so far
    pub fn notifies(&self) -> usize {
        self.notifies.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Link for LoopbackLink {
    fn write(&self, address: &LinkAddress, data: &[u8]) -> std::result::Result<(), LinkError> {
        if Self::take_one(&self.reject_next) {
            return Err(LinkError::Busy);
        }
        let route = self
            .routes
            .get(address)
            .ok_or_else(|| LinkError::NotConnected(address.to_string()))?;

        let failed = Self::take_one(&self.fail_next);
        let completion = if self.drop_completions.load(Ordering::SeqCst) {
            None
        } else {
            Some(!failed)
        };
        route
            .send(Delivery {
                bytes: (!failed).then(|| data.to_vec()),
                completion,
            })
            .map_err(|_| LinkError::NotConnected(address.to_string()))?;

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn notify(&self, address: &LinkAddress, data: &[u8]) -> std::result::Result<(), LinkError> {
        let route = self
            .routes
            .get(address)
            .ok_or_else(|| LinkError::NotConnected(address.to_string()))?;
        route
            .send(Delivery {
                bytes: Some(data.to_vec()),
                completion: None,
            })
            .map_err(|_| LinkError::NotConnected(address.to_string()))?;

        self.notifies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A transport wired to in-memory links
pub struct LoopbackNode {
    /// Node name, used to derive link addresses
    pub name: String,
    /// Node's peer id
    pub id: PeerId,
    /// The node's transport
    pub transport: Arc<MeshTransport>,
    /// The node's link
    pub link: Arc<LoopbackLink>,
    /// The node's connection registry
    pub table: Arc<LinkTable>,
}

impl LoopbackNode {
    /// Start a node with its own transport
    pub fn spawn(
        name: impl Into<String>,
        id: PeerId,
        config: TransportConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let link = Arc::new(LoopbackLink::new());
        let table = Arc::new(LinkTable::new());
        let (transport, events) = MeshTransport::start(config, link.clone(), table.clone())?;
        let transport = Arc::new(transport);
        link.bind(&transport);

        let node = Self {
            name: name.into(),
            id,
            transport,
            link,
            table,
        };
        Ok((node, events))
    }

    /// Address `self` uses for its client link to `server`
    pub fn client_address(&self, server: &LoopbackNode) -> LinkAddress {
        LinkAddress::from(format!("{}->{}", self.name, server.name))
    }

    /// Address `self` uses for its server link from `client`
    pub fn server_address(&self, client: &LoopbackNode) -> LinkAddress {
        LinkAddress::from(format!("{}<-{}", self.name, client.name))
    }

    /// Connect `client` to `server`
    pub fn connect(client: &LoopbackNode, server: &LoopbackNode, rssi: Option<i16>) {
        let client_side = client.client_address(server);
        let server_side = server.server_address(client);

        client.link.add_route(
            client_side.clone(),
            Arc::downgrade(&server.transport),
            server_side.clone(),
        );
        server.link.add_route(
            server_side.clone(),
            Arc::downgrade(&client.transport),
            client_side.clone(),
        );

        let mut client_info = LinkInfo::client(client_side).with_peer(server.id);
        let mut server_info = LinkInfo::server(server_side).with_peer(client.id);
        if let Some(rssi) = rssi {
            client_info = client_info.with_rssi(rssi);
            server_info = server_info.with_rssi(rssi);
        }
        client.table.upsert(client_info);
        server.table.upsert(server_info);
    }

    /// Tear down the connection made by [`connect`](Self::connect)
    pub fn disconnect(client: &LoopbackNode, server: &LoopbackNode) {
        let client_side = client.client_address(server);
        let server_side = server.server_address(client);

        client.link.remove_route(&client_side);
        server.link.remove_route(&server_side);
        client.table.remove(&client_side);
        server.table.remove(&server_side);
        client.transport.on_link_lost(&client_side);
        server.transport.on_link_lost(&server_side);
    }
}
