//! A torrent's table of known peers: created on first discovery (tracker,
//! PEX, incoming), kept sorted and deduplicated by address, and destroyed
//! only when the torrent itself is removed.

use std::net::SocketAddr;
use std::time::Instant;

use crate::Bitfield;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoverySource {
    Tracker,
    Pex,
    Incoming,
}

pub(crate) struct PeerRecord {
    pub addr: SocketAddr,
    pub source: DiscoverySource,
    pub client: Option<String>,
    pub listen_port: Option<u16>,
    pub have: Bitfield,
    pub banned: Option<Bitfield>,
    pub connected: bool,
    pub pex_enabled: bool,
    pub last_pex_tick: Option<Instant>,
}

impl PeerRecord {
    fn new(addr: SocketAddr, source: DiscoverySource, piece_count: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(piece_count, false);
        Self {
            addr,
            source,
            client: None,
            listen_port: None,
            have,
            banned: None,
            connected: false,
            pex_enabled: false,
            last_pex_tick: None,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.have.is_empty() {
            0.0
        } else {
            self.have.count_ones() as f64 / self.have.len() as f64
        }
    }
}

/// An address-sorted, deduplicated peer table for a single torrent.
#[derive(Default)]
pub(crate) struct PeerTable {
    peers: Vec<PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a newly discovered peer; a no-op if already known.
    pub fn insert(
        &mut self,
        addr: SocketAddr,
        source: DiscoverySource,
        piece_count: usize,
    ) -> bool {
        match self.peers.binary_search_by_key(&addr, |p| p.addr) {
            Ok(_) => false,
            Err(pos) => {
                self.peers
                    .insert(pos, PeerRecord::new(addr, source, piece_count));
                true
            }
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.peers
            .binary_search_by_key(addr, |p| p.addr)
            .ok()
            .map(|i| &self.peers[i])
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerRecord> {
        match self.peers.binary_search_by_key(addr, |p| p.addr) {
            Ok(i) => Some(&mut self.peers[i]),
            Err(_) => None,
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) {
        if let Ok(i) = self.peers.binary_search_by_key(addr, |p| p.addr) {
            self.peers.remove(i);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub fn connected(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter().filter(|p| p.connected)
    }

    pub fn connected_count(&self) -> usize {
        self.peers.iter().filter(|p| p.connected).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn insert_is_sorted_and_deduplicated() {
        let mut table = PeerTable::new();
        assert!(table.insert(addr(3), DiscoverySource::Tracker, 4));
        assert!(table.insert(addr(1), DiscoverySource::Pex, 4));
        assert!(!table.insert(addr(1), DiscoverySource::Incoming, 4));

        let addrs: Vec<_> = table.iter().map(|p| p.addr).collect();
        assert_eq!(addrs, vec![addr(1), addr(3)]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn progress_is_fraction_of_set_bits() {
        let mut table = PeerTable::new();
        table.insert(addr(1), DiscoverySource::Tracker, 4);
        let peer = table.get_mut(&addr(1)).unwrap();
        peer.have.set(0, true);
        peer.have.set(2, true);
        assert_eq!(peer.progress(), 0.5);
    }
}
