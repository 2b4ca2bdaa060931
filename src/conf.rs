//! Configuration for the peer subsystem: connection limits, the choking
//! algorithm's timing, and the MSE encryption policy.

use std::time::Duration;

use crate::peer::EncryptionPreference;
use crate::PeerId;

/// The default client id advertised in the BT handshake and to trackers.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-PW0001-000000000000";

/// Process-wide configuration for the engine that owns every torrent's peer
/// manager: the inbound listener and the cap on total connections across
/// all torrents.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// Local TCP port to accept inbound peer connections on. `None` means
    /// the engine never listens and only makes outbound connections.
    pub listen_port: Option<u16>,

    /// Upper bound on simultaneously connected peers across every torrent
    /// registered with the engine, independent of each torrent's own
    /// `TorrentConf::max_connected_peers`.
    pub max_connected_peers: usize,
}

impl EngineConf {
    pub fn new() -> Self {
        Self {
            listen_port: Some(6881),
            max_connected_peers: 400,
        }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-torrent configuration governing peer connections, choking, and the
/// background maintenance timers the peer manager drives.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The ID advertised to peers in the BT handshake.
    pub client_id: PeerId,

    /// Whether this torrent is private (no DHT, no PEX, no unsolicited
    /// peer exchange of any kind).
    pub private: bool,

    /// Upper bound on simultaneously connected peers for this torrent.
    pub max_connected_peers: usize,

    /// How many interested peers get unchoked at once by the regular
    /// choking round, not counting the optimistic unchoke slot.
    pub num_downloaders_to_unchoke: usize,

    /// How often the choking algorithm re-evaluates who to unchoke.
    pub rechoke_period: Duration,

    /// How often each connected peer's PEX diff is sent.
    pub pex_interval: Duration,

    /// How often the block refill scheduler tops up request queues that
    /// are running low.
    pub refill_delay: Duration,

    /// How often each peer session's pulse runs (drives throttled
    /// uploads and queued message flushes).
    pub peer_pulse: Duration,

    /// Ceiling on the rate-adaptive per-peer request queue cap.
    pub block_request_cap_max: usize,

    /// This client's MSE encryption policy for outbound connections.
    pub encryption: EncryptionConf,
}

impl TorrentConf {
    /// Reasonable defaults matching the canonical BEP 3/10 and µTorrent
    /// PEX timings.
    pub fn new() -> Self {
        Self {
            client_id: *DEFAULT_CLIENT_ID,
            private: false,
            max_connected_peers: 80,
            num_downloaders_to_unchoke: 4,
            rechoke_period: Duration::from_secs(600),
            pex_interval: Duration::from_secs(60),
            refill_delay: Duration::from_millis(5000),
            peer_pulse: Duration::from_millis(50),
            block_request_cap_max: 100,
            encryption: EncryptionConf::default(),
        }
    }
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self::new()
    }
}

/// This client's policy for the MSE handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionConf {
    pub preference: EncryptionPreference,
}

impl Default for EncryptionConf {
    fn default() -> Self {
        Self {
            preference: EncryptionPreference::EncryptionPreferred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_within_bep_bounds() {
        let conf = TorrentConf::new();
        assert!(conf.num_downloaders_to_unchoke < conf.max_connected_peers);
        assert!(conf.block_request_cap_max >= 2);
    }
}
