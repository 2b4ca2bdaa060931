//! The periodic choking algorithm: which peers get unchoked this round.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::SocketAddr;

use rand::seq::SliceRandom;
use rand::Rng;

/// A snapshot of one connected peer's interest and the rate the algorithm
/// should rank it by (peer→us while downloading, us→peer once the torrent
/// is a seed — the caller picks which before building the snapshot).
pub(crate) struct PeerSnapshot {
    pub addr: SocketAddr,
    pub interested: bool,
    pub rate: f64,
}

/// Runs one choking round and returns the addresses to unchoke: the top
/// `num_downloaders_to_unchoke` by *(interested desc, rate desc)*, plus any
/// remaining peer whose rate matches or beats the slowest of those (reward
/// fast peers that aren't currently interested), plus one uniformly random
/// optimistic unchoke from whoever is left.
pub(crate) fn rechoke(
    mut peers: Vec<PeerSnapshot>,
    num_downloaders_to_unchoke: usize,
    rng: &mut impl Rng,
) -> HashSet<SocketAddr> {
    peers.sort_by(|a, b| {
        b.interested.cmp(&a.interested).then_with(|| {
            b.rate.partial_cmp(&a.rate).unwrap_or(Ordering::Equal)
        })
    });

    let mut unchoked = HashSet::new();
    let split = num_downloaders_to_unchoke.min(peers.len());
    for p in &peers[..split] {
        unchoked.insert(p.addr);
    }
    if split == 0 {
        return unchoked;
    }

    let slowest_unchoked_rate = peers[..split]
        .iter()
        .map(|p| p.rate)
        .fold(f64::INFINITY, f64::min);

    let mut optimistic_pool = Vec::new();
    for p in &peers[split..] {
        if p.rate >= slowest_unchoked_rate {
            unchoked.insert(p.addr);
        } else {
            optimistic_pool.push(p.addr);
        }
    }

    if let Some(&addr) = optimistic_pool.choose(rng) {
        unchoked.insert(addr);
    }

    unchoked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn unchokes_top_n_interested_peers_by_rate() {
        let peers = vec![
            PeerSnapshot { addr: addr(1), interested: true, rate: 50.0 },
            PeerSnapshot { addr: addr(2), interested: true, rate: 40.0 },
            PeerSnapshot { addr: addr(3), interested: true, rate: 30.0 },
            PeerSnapshot { addr: addr(4), interested: true, rate: 20.0 },
            PeerSnapshot { addr: addr(5), interested: true, rate: 10.0 },
        ];
        let mut rng = StdRng::seed_from_u64(0);
        let unchoked = rechoke(peers, 4, &mut rng);

        for port in 1..=4 {
            assert!(unchoked.contains(&addr(port)), "peer {} should be unchoked", port);
        }
        // the fifth is either the optimistic unchoke or choked; it's the
        // only peer left in the pool so with any seed it becomes optimistic
        assert!(unchoked.contains(&addr(5)));
        assert_eq!(unchoked.len(), 5);
    }

    #[test]
    fn uninterested_fast_peer_is_rewarded() {
        let peers = vec![
            PeerSnapshot { addr: addr(1), interested: true, rate: 50.0 },
            PeerSnapshot { addr: addr(2), interested: false, rate: 100.0 },
        ];
        let mut rng = StdRng::seed_from_u64(0);
        let unchoked = rechoke(peers, 1, &mut rng);
        assert!(unchoked.contains(&addr(1)));
        assert!(unchoked.contains(&addr(2)));
    }

    #[test]
    fn empty_peer_list_unchokes_nobody() {
        let mut rng = StdRng::seed_from_u64(0);
        let unchoked = rechoke(Vec::new(), 4, &mut rng);
        assert!(unchoked.is_empty());
    }
}
