//! The top-level facade: owns every registered torrent's peer manager,
//! the shared on-disk piece store, and the inbound connection listener
//! that routes a newly accepted socket to the torrent it's asking about.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};

use crate::collab::{DiskIo, TorrentLookup};
use crate::conf::{EngineConf, TorrentConf};
use crate::crypto::sha1;
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::peer::{self, PeerIo};
use crate::storage_info::StorageInfo;
use crate::torrent::TorrentManager;
use crate::{PeerId, Sha1Hash, TorrentId};

pub use crate::torrent::manager::{PeerStats, TorrentStats};
pub use crate::torrent::DiscoverySource;

/// Process-wide state tying torrents, disk IO, and the inbound listener
/// together. Cheap to clone (it's always handed around as `Arc<Engine>`).
pub struct Engine {
    conf: EngineConf,
    client_id: PeerId,
    disk: Arc<Disk>,
    torrents: Mutex<HashMap<TorrentId, Arc<TorrentManager>>>,
    /// `SHA1("req2", info_hash) -> (id, info_hash)`, precomputed per
    /// registered torrent so an inbound MSE responder can resolve a
    /// connecting initiator's obfuscated hash without redoing the DH
    /// exchange's hashing for every candidate on every connection.
    by_req2: Mutex<HashMap<Sha1Hash, (TorrentId, Sha1Hash)>>,
    by_hash: Mutex<HashMap<Sha1Hash, TorrentId>>,
    next_id: AtomicU32,
}

impl Engine {
    pub fn new(conf: EngineConf, client_id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            conf,
            client_id,
            disk: Arc::new(Disk::new()),
            torrents: Mutex::new(HashMap::new()),
            by_req2: Mutex::new(HashMap::new()),
            by_hash: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    /// Registers a torrent, allocates it on disk, and starts its peer
    /// manager's background timers.
    pub async fn add_torrent(
        self: &Arc<Self>,
        metainfo: &Metainfo,
        download_dir: PathBuf,
        conf: TorrentConf,
    ) -> Result<TorrentId> {
        let storage = StorageInfo::new(metainfo, download_dir);
        let info_hash = metainfo.info_hash();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.disk
            .add_torrent(id, storage.clone(), metainfo.piece_hashes.clone())
            .await?;

        let req2 = sha1(&[b"req2", &info_hash]);
        self.by_req2.lock().unwrap().insert(req2, (id, info_hash));
        self.by_hash.lock().unwrap().insert(info_hash, id);

        let manager = TorrentManager::new(
            id,
            info_hash,
            self.client_id,
            self.conf.listen_port,
            storage.piece_count,
            storage.piece_len,
            storage.last_piece_len,
            conf,
            Arc::clone(&self.disk) as Arc<dyn DiskIo>,
        );
        self.torrents.lock().unwrap().insert(id, manager);
        Ok(id)
    }

    fn torrent(&self, id: TorrentId) -> Result<Arc<TorrentManager>> {
        self.torrents
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidTorrentId)
    }

    /// Feeds a tracker or PEX compact peer list to a torrent's manager.
    pub fn add_peers(&self, id: TorrentId, source: DiscoverySource, compact: &[u8]) -> Result<()> {
        self.torrent(id)?.add_peers(source, compact);
        Ok(())
    }

    pub fn torrent_stats(&self, id: TorrentId) -> Result<TorrentStats> {
        Ok(self.torrent(id)?.torrent_stats())
    }

    pub fn peer_stats(&self, id: TorrentId, addr: &SocketAddr) -> Result<Option<PeerStats>> {
        Ok(self.torrent(id)?.peer_stats(addr))
    }

    /// Fills an `n`-bucket availability summary for `id`'s progress bar:
    /// bucket `i` is `-1` if the client already holds its representative
    /// piece, else the number of connected peers advertising it.
    pub fn torrent_availability(&self, id: TorrentId, n: usize) -> Result<Vec<i32>> {
        Ok(self.torrent(id)?.torrent_availability(n))
    }

    /// Binds the configured listen port, if any, and accepts inbound peer
    /// connections for as long as the engine runs.
    pub async fn listen(self: Arc<Self>) -> Result<()> {
        let port = match self.conf.listen_port {
            Some(port) => port,
            None => return Ok(()),
        };
        let addr: std::net::SocketAddr = format!("0.0.0.0:{}", port).parse().expect("valid socket address");
        let mut listener = TcpListener::bind(addr).await?;
        loop {
            let (socket, addr) = listener.accept().await?;
            socket.set_nodelay(true).ok();
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                engine.handle_incoming(socket, addr).await;
            });
        }
    }

    async fn handle_incoming(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let io = PeerIo::from_accepted(socket, addr);
        let lookup = {
            let engine = Arc::clone(&self);
            move |req2: &Sha1Hash| {
                engine
                    .find_torrent_by_obfuscated_hash(req2)
                    .map(|(_, hash)| hash)
            }
        };

        let outcome = peer::inbound(io, self.client_id, self.conf.listen_port, lookup).await;
        let (outcome, info_hash) = match outcome {
            Ok(pair) => pair,
            Err(_) => return,
        };

        let id = match self.find_torrent_by_hash(&info_hash) {
            Some(id) => id,
            None => return,
        };
        if self.total_connected_peers() >= self.conf.max_connected_peers {
            return;
        }
        if let Ok(manager) = self.torrent(id) {
            manager.complete_connection(addr, outcome).await;
        }
    }

    /// Sum of connected peers across every registered torrent, checked
    /// against [`EngineConf::max_connected_peers`] on inbound admission; a
    /// torrent's own `TorrentConf::max_connected_peers` is enforced
    /// independently by its manager.
    fn total_connected_peers(&self) -> usize {
        self.torrents
            .lock()
            .unwrap()
            .values()
            .map(|t| t.torrent_stats().connected_peers)
            .sum()
    }
}

impl TorrentLookup for Engine {
    fn find_torrent_by_hash(&self, hash: &Sha1Hash) -> Option<TorrentId> {
        self.by_hash.lock().unwrap().get(hash).copied()
    }

    fn find_torrent_by_obfuscated_hash(&self, obfuscated: &Sha1Hash) -> Option<(TorrentId, Sha1Hash)> {
        self.by_req2.lock().unwrap().get(obfuscated).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;

    fn sample_metainfo(name: &str, piece_len: u32, data_len: u64) -> Metainfo {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bencode::bytes(name.to_string()));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![3u8; 20]));
        info.insert(b"piece length".to_vec(), Value::Int(piece_len as i64));
        info.insert(b"length".to_vec(), Value::Int(data_len as i64));
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode_to_vec(&Value::Dict(top));
        Metainfo::from_bytes(&bytes).unwrap()
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "peerwire-engine-test-{}-{}-{}",
            std::process::id(),
            tag,
            rand::random::<u64>()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn test_engine_conf() -> EngineConf {
        EngineConf {
            listen_port: None,
            max_connected_peers: 400,
        }
    }

    #[tokio::test]
    async fn add_torrent_registers_hash_lookups() {
        let engine = Engine::new(test_engine_conf(), *crate::conf::DEFAULT_CLIENT_ID);
        let metainfo = sample_metainfo("a", 16384, 16384);
        let info_hash = metainfo.info_hash();

        let id = engine
            .add_torrent(&metainfo, scratch_dir("registers"), TorrentConf::new())
            .await
            .unwrap();

        assert_eq!(engine.find_torrent_by_hash(&info_hash), Some(id));

        let req2 = sha1(&[b"req2", &info_hash]);
        assert_eq!(
            engine.find_torrent_by_obfuscated_hash(&req2),
            Some((id, info_hash))
        );
    }

    #[tokio::test]
    async fn unregistered_torrent_lookups_return_invalid_id_error() {
        let engine = Engine::new(test_engine_conf(), *crate::conf::DEFAULT_CLIENT_ID);
        assert!(matches!(
            engine.torrent_stats(999),
            Err(Error::InvalidTorrentId)
        ));
        assert!(matches!(
            engine.peer_stats(999, &"127.0.0.1:6881".parse().unwrap()),
            Err(Error::InvalidTorrentId)
        ));
        assert!(matches!(
            engine.torrent_availability(999, 10),
            Err(Error::InvalidTorrentId)
        ));
    }

    #[tokio::test]
    async fn add_peers_reaches_the_right_torrents_manager() {
        let engine = Engine::new(test_engine_conf(), *crate::conf::DEFAULT_CLIENT_ID);
        let metainfo = sample_metainfo("b", 16384, 16384);
        let id = engine
            .add_torrent(&metainfo, scratch_dir("add-peers"), TorrentConf::new())
            .await
            .unwrap();

        let compact = vec![127, 0, 0, 1, 0x1A, 0xE1];
        engine.add_peers(id, DiscoverySource::Tracker, &compact).unwrap();

        let availability = engine.torrent_availability(id, 1).unwrap();
        assert_eq!(availability.len(), 1);

        assert!(matches!(
            engine.add_peers(123, DiscoverySource::Tracker, &compact),
            Err(Error::InvalidTorrentId)
        ));
    }

    #[tokio::test]
    async fn listen_is_a_noop_when_no_port_is_configured() {
        let engine = Engine::new(test_engine_conf(), *crate::conf::DEFAULT_CLIENT_ID);
        engine.listen().await.unwrap();
    }
}
