use chrono::{DateTime, Utc};
use dashmap::DashMap;
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;

/// How a peer first came to our attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    Bootstrap,
    Mdns,
    Manual,
}

/// A peer this node has successfully connected to.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub source: PeerSource,
    pub last_seen: DateTime<Utc>,
}

/// Peers this node has connected to, keyed by PeerId.
///
/// Thread-safe via DashMap. Entries are added on successful connect and
/// refreshed by identify; they outlive the connection and are only cleared
/// when the network stops.
#[derive(Default)]
pub struct PeerDirectory {
    peers: DashMap<PeerId, PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful connection, merging addresses with any existing entry.
    pub fn record_connected(&self, peer_id: PeerId, addrs: Vec<Multiaddr>, source: PeerSource) {
        self.peers
            .entry(peer_id)
            .and_modify(|entry| {
                for addr in &addrs {
                    if !entry.addrs.contains(addr) {
                        entry.addrs.push(addr.clone());
                    }
                }
                entry.last_seen = Utc::now();
            })
            .or_insert_with(|| PeerRecord {
                peer_id,
                addrs: addrs.clone(),
                source,
                last_seen: Utc::now(),
            });
    }

    /// Replace a known peer's addresses with what it advertised via identify.
    /// Unknown peers are ignored.
    pub fn update_addrs(&self, peer_id: &PeerId, addrs: Vec<Multiaddr>) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            if !addrs.is_empty() {
                entry.addrs = addrs;
            }
            entry.last_seen = Utc::now();
        }
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|e| e.value().clone())
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_merges_addresses() {
        let dir = PeerDirectory::new();
        let peer = PeerId::random();
        let a: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        let b: Multiaddr = "/ip4/10.0.0.2/tcp/4001".parse().unwrap();

        dir.record_connected(peer, vec![a.clone()], PeerSource::Bootstrap);
        dir.record_connected(peer, vec![a.clone(), b.clone()], PeerSource::Mdns);

        let record = dir.get(&peer).unwrap();
        assert_eq!(record.addrs, vec![a, b]);
        assert_eq!(record.source, PeerSource::Bootstrap);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_update_ignores_unknown_peer() {
        let dir = PeerDirectory::new();
        dir.update_addrs(&PeerId::random(), vec!["/ip4/1.2.3.4/tcp/1".parse().unwrap()]);
        assert!(dir.is_empty());
    }
}
