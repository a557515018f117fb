//! Logical peer to concrete link resolution.
//!
//! A peer may be reachable over two physical paths at once: we connected out
//! to it (client role) and it connected in to us (server role). Every
//! resolution picks exactly one path per peer with a single ranking:
//!
//! 1. client write beats server notify (acknowledged, windowed)
//! 2. stronger signal beats weaker; no reading ranks last
//! 3. lower address wins ties, so results are deterministic
//!
//! Links whose peer identity is still unknown are kept apart, one target per
//! address, and never merged into an identified peer.

use crate::link::{ConnectionRegistry, LinkAddress, LinkInfo, LinkRole};
use crate::unit::Priority;
use gattmesh_core::PeerId;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a target is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// Write to the remote's characteristic
    ClientWrite,
    /// Notify the subscribed remote
    ServerNotify,
}

impl TargetKind {
    /// Scheduler class for units sent this way
    pub fn priority(self) -> Priority {
        match self {
            TargetKind::ClientWrite => Priority::High,
            TargetKind::ServerNotify => Priority::Low,
        }
    }

    fn rank(self) -> u8 {
        match self {
            TargetKind::ClientWrite => 0,
            TargetKind::ServerNotify => 1,
        }
    }
}

/// One resolved destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Link to send on
    pub address: LinkAddress,
    /// Send mode
    pub kind: TargetKind,
    /// Peer behind the link, if known
    pub peer_id: Option<PeerId>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl Target {
    fn from_link(info: &LinkInfo) -> Self {
        let kind = match info.role {
            LinkRole::Client => TargetKind::ClientWrite,
            LinkRole::Server => TargetKind::ServerNotify,
        };
        Self {
            address: info.address.clone(),
            kind,
            peer_id: info.peer_id,
            rssi: info.rssi,
        }
    }
}

/// Ranks `a` against `b`; `Less` means `a` is the better path
fn rank(a: &Target, b: &Target) -> Ordering {
    a.kind
        .rank()
        .cmp(&b.kind.rank())
        .then_with(|| match (a.rssi, b.rssi) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.address.cmp(&b.address))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum DedupKey {
    Peer(PeerId),
    Address(LinkAddress),
}

/// Resolves peers to targets against a connection registry
pub struct TargetResolver {
    registry: Arc<dyn ConnectionRegistry>,
}

impl TargetResolver {
    /// Create a resolver reading `registry` on every call
    pub fn new(registry: Arc<dyn ConnectionRegistry>) -> Self {
        Self { registry }
    }

    fn candidates(&self) -> impl Iterator<Item = Target> {
        self.registry
            .links()
            .into_iter()
            .filter(LinkInfo::is_usable)
            .map(|info| Target::from_link(&info))
    }

    /// Best single path to `peer`
    pub fn resolve_one(&self, peer: PeerId) -> Option<Target> {
        let best = self
            .candidates()
            .filter(|t| t.peer_id == Some(peer))
            .min_by(rank);

        match &best {
            Some(target) => tracing::trace!(
                "Resolved peer {} to {} ({:?})",
                peer,
                target.address,
                target.kind
            ),
            None => tracing::debug!("No usable link for peer {}", peer),
        }
        best
    }

    /// One target per reachable peer, minus the arrival link and the sender
    pub fn resolve_broadcast(
        &self,
        exclude_address: Option<&LinkAddress>,
        exclude_sender: Option<PeerId>,
    ) -> Vec<Target> {
        let best = self
            .candidates()
            .filter(|t| exclude_address != Some(&t.address))
            .filter(|t| exclude_sender.is_none() || t.peer_id != exclude_sender)
            .fold(BTreeMap::new(), |mut best, target| {
                let key = match target.peer_id {
                    Some(peer) => DedupKey::Peer(peer),
                    None => DedupKey::Address(target.address.clone()),
                };
                match best.get(&key) {
                    Some(current) if rank(&target, current) != Ordering::Less => {}
                    _ => {
                        best.insert(key, target);
                    }
                }
                best
            });

        let targets: Vec<Target> = best.into_values().collect();
        tracing::trace!("Broadcast resolved to {} targets", targets.len());
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkTable;

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 8])
    }

    fn resolver(table: LinkTable) -> TargetResolver {
        TargetResolver::new(Arc::new(table))
    }

    #[test]
    fn test_client_preferred_over_stronger_server() {
        let table = LinkTable::new();
        table.upsert(LinkInfo::client("c-P").with_peer(peer(1)).with_rssi(-40));
        table.upsert(LinkInfo::server("s-P").with_peer(peer(1)).with_rssi(-60));
        let target = resolver(table).resolve_one(peer(1)).unwrap();
        assert_eq!(target.address.as_str(), "c-P");
        assert_eq!(target.kind, TargetKind::ClientWrite);

        let table = LinkTable::new();
        table.upsert(LinkInfo::client("c-P").with_peer(peer(1)).with_rssi(-90));
        table.upsert(LinkInfo::server("s-P").with_peer(peer(1)).with_rssi(-30));
        let target = resolver(table).resolve_one(peer(1)).unwrap();
        assert_eq!(target.kind, TargetKind::ClientWrite);
    }

    #[test]
    fn test_server_fallback_when_client_unwritable() {
        let table = LinkTable::new();
        let mut client = LinkInfo::client("c-P").with_peer(peer(1));
        client.writable = false;
        table.upsert(client);
        table.upsert(LinkInfo::server("s-P").with_peer(peer(1)));

        let target = resolver(table).resolve_one(peer(1)).unwrap();
        assert_eq!(target.address.as_str(), "s-P");
        assert_eq!(target.kind.priority(), Priority::Low);
    }

    #[test]
    fn test_same_kind_picks_best_signal() {
        let table = LinkTable::new();
        table.upsert(LinkInfo::server("s1").with_peer(peer(1)).with_rssi(-80));
        table.upsert(LinkInfo::server("s2").with_peer(peer(1)).with_rssi(-50));
        table.upsert(LinkInfo::server("s3").with_peer(peer(1)));
        let target = resolver(table).resolve_one(peer(1)).unwrap();
        assert_eq!(target.address.as_str(), "s2");
    }

    #[test]
    fn test_unknown_peer_unresolved() {
        let table = LinkTable::new();
        table.upsert(LinkInfo::client("c").with_peer(peer(1)));
        assert!(resolver(table).resolve_one(peer(9)).is_none());
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let table = LinkTable::new();
        table.upsert(LinkInfo::client("a").with_peer(peer(1)));
        table.upsert(LinkInfo::client("b").with_peer(peer(2)));
        table.upsert(LinkInfo::server("c").with_peer(peer(3)));

        let targets = resolver(table).resolve_broadcast(None, Some(peer(3)));
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.peer_id != Some(peer(3))));
    }

    #[test]
    fn test_broadcast_dedups_peer_across_paths() {
        let table = LinkTable::new();
        table.upsert(LinkInfo::client("c-1").with_peer(peer(1)));
        table.upsert(LinkInfo::server("s-1").with_peer(peer(1)));
        table.upsert(LinkInfo::server("s-2").with_peer(peer(2)));

        let targets = resolver(table).resolve_broadcast(None, None);
        assert_eq!(targets.len(), 2);
        let one = targets.iter().find(|t| t.peer_id == Some(peer(1))).unwrap();
        assert_eq!(one.kind, TargetKind::ClientWrite);
    }

    #[test]
    fn test_broadcast_excludes_arrival_link() {
        let table = LinkTable::new();
        table.upsert(LinkInfo::client("a").with_peer(peer(1)));
        table.upsert(LinkInfo::client("b").with_peer(peer(2)));

        let from = LinkAddress::from("a");
        let targets = resolver(table).resolve_broadcast(Some(&from), None);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address.as_str(), "b");
    }

    #[test]
    fn test_anonymous_links_kept_per_address() {
        let table = LinkTable::new();
        table.upsert(LinkInfo::client("x"));
        table.upsert(LinkInfo::server("y"));
        table.upsert(LinkInfo::client("z").with_peer(peer(1)));

        let targets = resolver(table).resolve_broadcast(None, Some(peer(7)));
        assert_eq!(targets.len(), 3);
    }
}
