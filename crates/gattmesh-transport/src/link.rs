//! Link-layer collaborator contracts and the in-memory connection table.
//!
//! The radio stack itself (scan, connect, advertise, MTU negotiation) lives
//! outside this crate. The engine only needs:
//!
//! - [`Link`]: synchronous accept/reject for client writes and server
//!   notifications. Completions come back through
//!   [`MeshTransport::on_write_completed`](crate::MeshTransport::on_write_completed).
//! - [`ConnectionRegistry`]: the current set of links with their roles,
//!   signal quality and peer identity, consumed by the target resolver.

use crate::error::LinkError;
use dashmap::DashMap;
use gattmesh_core::PeerId;
use std::fmt;
use std::sync::Arc;

/// Address of one concrete link (device address as seen by this node)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddress(Arc<str>);

impl LinkAddress {
    /// Create an address
    pub fn new(address: impl Into<Arc<str>>) -> Self {
        Self(address.into())
    }

    /// Address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LinkAddress {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for LinkAddress {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkAddress({})", self.0)
    }
}

/// Which side of the GATT connection this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// This node connected out and writes to the remote's characteristic
    Client,
    /// The remote connected in and subscribed to our notifications
    Server,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Registry view of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Link address
    pub address: LinkAddress,
    /// Our role on this link
    pub role: LinkRole,
    /// Remote peer identity, once announced
    pub peer_id: Option<PeerId>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
    /// Client links: write characteristic discovered
    pub writable: bool,
    /// Server links: remote subscribed to notifications
    pub subscribed: bool,
}

impl LinkInfo {
    /// Write-capable client link
    pub fn client(address: impl Into<LinkAddress>) -> Self {
        Self {
            address: address.into(),
            role: LinkRole::Client,
            peer_id: None,
            rssi: None,
            writable: true,
            subscribed: false,
        }
    }

    /// Subscribed server link
    pub fn server(address: impl Into<LinkAddress>) -> Self {
        Self {
            address: address.into(),
            role: LinkRole::Server,
            peer_id: None,
            rssi: None,
            writable: false,
            subscribed: true,
        }
    }

    /// Attach the remote's peer id
    pub fn with_peer(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Attach a signal-quality reading
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Whether the link can carry data in its role right now
    pub fn is_usable(&self) -> bool {
        match self.role {
            LinkRole::Client => self.writable,
            LinkRole::Server => self.subscribed,
        }
    }
}

/// Physical link primitives
///
/// Both calls must return promptly: they report whether the stack accepted
/// the operation, not whether the remote received it.
pub trait Link: Send + Sync + 'static {
    /// Write to the remote's characteristic (client role)
    fn write(&self, address: &LinkAddress, data: &[u8]) -> Result<(), LinkError>;

    /// Notify a subscribed remote (server role)
    fn notify(&self, address: &LinkAddress, data: &[u8]) -> Result<(), LinkError>;
}

/// Source of the current link set
pub trait ConnectionRegistry: Send + Sync {
    /// Snapshot of all known links
    fn links(&self) -> Vec<LinkInfo>;
}

/// Concurrent link table: address → link info
///
/// A ready-made [`ConnectionRegistry`] for hosts that do not keep their own.
/// Uses DashMap so connection callbacks can update it from any thread.
#[derive(Default)]
pub struct LinkTable {
    links: DashMap<LinkAddress, LinkInfo>,
}

impl LinkTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a link
    pub fn upsert(&self, info: LinkInfo) {
        tracing::debug!(
            "Link up: {} ({}) peer={}",
            info.address,
            info.role,
            info.peer_id.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
        );
        self.links.insert(info.address.clone(), info);
    }

    /// Remove a link
    pub fn remove(&self, address: &LinkAddress) -> Option<LinkInfo> {
        tracing::debug!("Link down: {}", address);
        self.links.remove(address).map(|(_, v)| v)
    }

    /// Record the peer id announced on a link
    pub fn set_peer(&self, address: &LinkAddress, peer_id: PeerId) -> bool {
        match self.links.get_mut(address) {
            Some(mut info) => {
                info.peer_id = Some(peer_id);
                true
            }
            None => false,
        }
    }

    /// Record a signal-quality reading
    pub fn set_rssi(&self, address: &LinkAddress, rssi: i16) -> bool {
        match self.links.get_mut(address) {
            Some(mut info) => {
                info.rssi = Some(rssi);
                true
            }
            None => false,
        }
    }

    /// Look up a link
    pub fn get(&self, address: &LinkAddress) -> Option<LinkInfo> {
        self.links.get(address).map(|entry| entry.value().clone())
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl ConnectionRegistry for LinkTable {
    fn links(&self) -> Vec<LinkInfo> {
        self.links.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_info_usability() {
        assert!(LinkInfo::client("AA").is_usable());
        assert!(LinkInfo::server("BB").is_usable());

        let mut info = LinkInfo::client("AA");
        info.writable = false;
        assert!(!info.is_usable());

        let mut info = LinkInfo::server("BB");
        info.subscribed = false;
        assert!(!info.is_usable());
    }

    #[test]
    fn test_link_table_updates() {
        let table = LinkTable::new();
        let addr = LinkAddress::from("AA:BB");
        table.upsert(LinkInfo::client(addr.clone()));
        assert_eq!(table.len(), 1);

        assert!(table.set_peer(&addr, PeerId::new([1; 8])));
        assert!(table.set_rssi(&addr, -55));
        let info = table.get(&addr).unwrap();
        assert_eq!(info.peer_id, Some(PeerId::new([1; 8])));
        assert_eq!(info.rssi, Some(-55));

        assert!(!table.set_rssi(&LinkAddress::from("missing"), -1));
        assert!(table.remove(&addr).is_some());
        assert!(table.is_empty());
    }
}
