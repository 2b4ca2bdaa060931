//! The per-torrent peer manager: owns the peer set, drives connection
//! admission, and runs the periodic choking and block-refill rounds.
//!
//! Each connected peer's [`PeerSession`] lives on its own Tokio task,
//! which loops between reading its socket, running its pulse, and
//! applying [`SessionCommand`]s sent through the [`Bridge`]. The manager
//! itself never touches a session directly; it only ever reaches a peer
//! through the bridge, and only ever learns about a peer's state through
//! [`PeerEvent`]s it subscribed to.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::interval;

use crate::bridge::{Bridge, SessionCommand};
use crate::collab::{DiskIo, RateControl};
use crate::conf::TorrentConf;
use crate::event::{PeerEvent, Publisher};
use crate::peer::{self, AddRequestOutcome, HandshakeOutcome, PeerIo, PeerSession};
use crate::torrent::block::{Block, Priority};
use crate::torrent::choke::{self, PeerSnapshot};
use crate::torrent::peer_record::{DiscoverySource, PeerTable};
use crate::torrent::scarcity;
use crate::{block_count, block_len, Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId, BLOCK_LEN};

/// Aggregate, read-only snapshot of a torrent's progress and transfer
/// totals, for the stats endpoints named alongside the peer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorrentStats {
    pub piece_count: usize,
    pub have_count: usize,
    pub connected_peers: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub corrupted: u64,
}

/// A single connected peer's transfer stats and interest flags, as last
/// reported by its session task.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub corrupted: u64,
    pub rate_to_peer: f64,
    pub rate_to_client: f64,
    /// We are interested in blocks this peer has.
    pub client_interested: bool,
    /// This peer is interested in blocks we have.
    pub peer_interested: bool,
}

struct Shared {
    peers: PeerTable,
    blocks: Vec<Block>,
    client_have: Bitfield,
    dnd: Bitfield,
    banned: Option<Bitfield>,
    stats: HashMap<SocketAddr, PeerStats>,
}

pub(crate) struct TorrentManager {
    id: TorrentId,
    info_hash: Sha1Hash,
    client_id: PeerId,
    listen_port: Option<u16>,
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
    blocks_per_piece: Vec<usize>,
    conf: TorrentConf,
    disk: Arc<dyn DiskIo>,
    publisher: Arc<Publisher>,
    bridge: Arc<Bridge>,
    shared: Mutex<Shared>,
    refill_armed: AtomicBool,
}

impl TorrentManager {
    pub(crate) fn new(
        id: TorrentId,
        info_hash: Sha1Hash,
        client_id: PeerId,
        listen_port: Option<u16>,
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
        conf: TorrentConf,
        disk: Arc<dyn DiskIo>,
    ) -> Arc<Self> {
        let blocks_per_piece: Vec<usize> = (0..piece_count)
            .map(|i| {
                let len = if i == piece_count - 1 {
                    last_piece_len
                } else {
                    piece_len
                };
                block_count(len)
            })
            .collect();
        let total_blocks = blocks_per_piece.iter().sum();

        let mut client_have = Bitfield::new();
        client_have.resize(piece_count, false);
        let mut dnd = Bitfield::new();
        dnd.resize(piece_count, false);

        let manager = Arc::new(Self {
            id,
            info_hash,
            client_id,
            listen_port,
            piece_count,
            piece_len,
            last_piece_len,
            blocks_per_piece,
            conf,
            disk,
            publisher: Arc::new(Publisher::new()),
            bridge: Arc::new(Bridge::new()),
            shared: Mutex::new(Shared {
                peers: PeerTable::new(),
                blocks: vec![Block::new(Priority::Normal); total_blocks],
                client_have,
                dnd,
                banned: None,
                stats: HashMap::new(),
            }),
            refill_armed: AtomicBool::new(false),
        });

        manager.subscribe_to_events();
        manager.spawn_timers();
        manager
    }

    pub(crate) fn id(&self) -> TorrentId {
        self.id
    }

    pub(crate) fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    fn subscribe_to_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.publisher.subscribe(move |addr, event| {
            if let Some(manager) = weak.upgrade() {
                manager.on_peer_event(addr, event);
            }
        });
    }

    fn spawn_timers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let period = self.conf.rechoke_period;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                manager.run_choke_round();
            }
        });

        let manager = Arc::clone(self);
        let period = self.conf.pex_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                manager.run_pex_tick();
            }
        });
    }

    /// Reacts to a domain event published by one of this torrent's peer
    /// sessions.
    fn on_peer_event(self: &Arc<Self>, addr: SocketAddr, event: &PeerEvent) {
        match event {
            PeerEvent::PeerBitfield(bits) => {
                let mut shared = self.shared.lock().unwrap();
                if let Some(peer) = shared.peers.get_mut(&addr) {
                    peer.have = bits.clone();
                }
                scarcity::apply_bitfield(&mut shared.blocks, &self.blocks_per_piece, bits);
            }
            PeerEvent::PeerHave(piece) => {
                let piece = *piece;
                let mut shared = self.shared.lock().unwrap();
                if let Some(peer) = shared.peers.get_mut(&addr) {
                    if piece < peer.have.len() {
                        peer.have.set(piece, true);
                    }
                }
                scarcity::apply_have(&mut shared.blocks, &self.blocks_per_piece, piece);
            }
            PeerEvent::ClientBlock {
                piece_index,
                offset,
                ..
            } => self.on_client_block(addr, *piece_index, *offset),
            PeerEvent::ClientHave(piece) => self.on_client_have(*piece),
            PeerEvent::GotPex { added, dropped } => self.on_got_pex(added, dropped),
            PeerEvent::BlocksRunningLow => self.arm_refill(),
            PeerEvent::GotError => self.on_peer_disconnected(&addr),
        }
    }

    fn block_index(&self, piece_index: PieceIndex, offset: u32) -> usize {
        let start: usize = self.blocks_per_piece[..piece_index].iter().sum();
        start + (offset / BLOCK_LEN) as usize
    }

    /// Marks the received block as held and, once every block in its
    /// piece is accounted for, kicks off hash verification.
    fn on_client_block(self: &Arc<Self>, addr: SocketAddr, piece_index: PieceIndex, offset: u32) {
        let piece_complete = {
            let mut shared = self.shared.lock().unwrap();
            let index = self.block_index(piece_index, offset);
            if let Some(block) = shared.blocks.get_mut(index) {
                block.have = true;
            }
            let start: usize = self.blocks_per_piece[..piece_index].iter().sum();
            let count = self.blocks_per_piece[piece_index];
            shared.blocks[start..start + count].iter().all(|b| b.have)
        };

        if piece_complete {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.verify_piece(addr, piece_index).await;
            });
        }
    }

    async fn verify_piece(self: Arc<Self>, addr: SocketAddr, piece_index: PieceIndex) {
        let ok = self.disk.io_hash(self.id, piece_index).await.unwrap_or(false);
        if !ok {
            // Either corrupted or a spurious call before the piece was
            // actually whole; either way the blocks are re-armed for the
            // refill scheduler rather than left permanently "have".
            let mut shared = self.shared.lock().unwrap();
            let start: usize = self.blocks_per_piece[..piece_index].iter().sum();
            let count = self.blocks_per_piece[piece_index];
            for block in &mut shared.blocks[start..start + count] {
                block.have = false;
                block.request_count = 0;
            }
        }
        self.bridge.send(&addr, SessionCommand::PieceVerified(piece_index, ok));
    }

    fn on_client_have(self: &Arc<Self>, piece: PieceIndex) {
        let (client_have, dnd, banned) = {
            let mut shared = self.shared.lock().unwrap();
            if piece < shared.client_have.len() {
                shared.client_have.set(piece, true);
            }
            (shared.client_have.clone(), shared.dnd.clone(), shared.banned.clone())
        };
        self.bridge.broadcast(|| SessionCommand::Have(piece));
        self.bridge.broadcast(|| SessionCommand::RecomputeInterest {
            client_have: client_have.clone(),
            dnd: dnd.clone(),
            banned: banned.clone(),
        });
    }

    fn on_got_pex(self: &Arc<Self>, added: &[(SocketAddr, u8)], _dropped: &[SocketAddr]) {
        if self.conf.private {
            return;
        }
        let mut shared = self.shared.lock().unwrap();
        for &(addr, _flags) in added {
            shared.peers.insert(addr, DiscoverySource::Pex, self.piece_count);
        }
        drop(shared);
        self.maybe_connect();
    }

    fn on_peer_disconnected(&self, addr: &SocketAddr) {
        self.bridge.unregister(addr);
        let mut shared = self.shared.lock().unwrap();
        shared.peers.remove(addr);
        shared.stats.remove(addr);
    }

    fn arm_refill(self: &Arc<Self>) {
        if self
            .refill_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let manager = Arc::clone(self);
        let delay = self.conf.refill_delay;
        tokio::spawn(async move {
            tokio::time::delay_for(delay).await;
            manager.refill_armed.store(false, Ordering::SeqCst);
            manager.run_refill().await;
        });
    }

    /// Parses a BEP 23 compact peer list (4 bytes IPv4 + 2 bytes port,
    /// big endian) and registers each address as discovered via `source`.
    pub(crate) fn add_peers(self: &Arc<Self>, source: DiscoverySource, compact: &[u8]) {
        let mut shared = self.shared.lock().unwrap();
        for chunk in compact.chunks_exact(6) {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
            shared.peers.insert(addr, source, self.piece_count);
        }
        drop(shared);
        self.maybe_connect();
    }

    /// Dials out to known, not-yet-connected peers up to the torrent's
    /// connection cap.
    pub(crate) fn maybe_connect(self: &Arc<Self>) {
        let candidates: Vec<SocketAddr> = {
            let shared = self.shared.lock().unwrap();
            let slots = self
                .conf
                .max_connected_peers
                .saturating_sub(shared.peers.connected_count());
            shared
                .peers
                .iter()
                .filter(|p| !p.connected)
                .map(|p| p.addr)
                .take(slots)
                .collect()
        };

        for addr in candidates {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.connect_to(addr).await;
            });
        }
    }

    async fn connect_to(self: Arc<Self>, addr: SocketAddr) {
        let io = match PeerIo::connect(addr).await {
            Ok(io) => io,
            Err(_) => return,
        };
        let outcome = peer::outbound(
            io,
            self.info_hash,
            self.client_id,
            self.listen_port,
            self.conf.encryption.preference,
        )
        .await;
        if let Ok(outcome) = outcome {
            self.complete_connection(addr, outcome).await;
        }
    }

    /// Registers a just-completed handshake (inbound or outbound) and
    /// spawns the Tokio task that drives the resulting session.
    pub(crate) async fn complete_connection(self: &Arc<Self>, addr: SocketAddr, outcome: HandshakeOutcome) {
        let admitted = {
            let mut shared = self.shared.lock().unwrap();
            shared.peers.insert(addr, DiscoverySource::Incoming, self.piece_count);
            if shared.peers.connected_count() >= self.conf.max_connected_peers {
                false
            } else {
                if let Some(peer) = shared.peers.get_mut(&addr) {
                    peer.connected = true;
                    peer.pex_enabled = outcome.extended.is_some() && !self.conf.private;
                    peer.client = Some(hex::encode(outcome.peer_id));
                }
                true
            }
        };
        if !admitted {
            return;
        }

        let session = PeerSession::new(
            addr,
            self.id,
            self.info_hash,
            BLOCK_LEN,
            self.piece_count,
            self.conf.private,
            outcome.framed,
            Arc::clone(&self.disk),
            Arc::clone(&self.publisher),
            self.conf.block_request_cap_max,
        );

        let cmd_rx = self.bridge.register(addr);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_peer(addr, session, cmd_rx).await;
        });

        // Kick an immediate choke round so a newly admitted peer doesn't
        // wait out a full rechoke period before it can be unchoked.
        self.run_choke_round();
    }

    async fn run_peer(
        self: Arc<Self>,
        addr: SocketAddr,
        mut session: PeerSession,
        mut cmd_rx: UnboundedReceiver<SessionCommand>,
    ) {
        let mut pulse = interval(self.conf.peer_pulse);
        loop {
            tokio::select! {
                msg = session.poll_message() => {
                    match msg {
                        Ok(true) => {}
                        Ok(false) | Err(_) => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::SetChoke(choke)) => session.queue_set_choke(choke),
                        Some(SessionCommand::Have(piece)) => session.queue_have(piece),
                        Some(SessionCommand::Bitfield(bits)) => session.queue_bitfield(bits),
                        Some(SessionCommand::PieceVerified(piece, ok)) => {
                            session.on_piece_verified(piece, ok);
                        }
                        Some(SessionCommand::Request(piece, offset, length, reply)) => {
                            let outcome = session.add_request(piece, offset, length);
                            let _ = reply.send(outcome);
                        }
                        Some(SessionCommand::PexTick(peers)) => {
                            if session.pex_tick(&peers).await.is_err() {
                                break;
                            }
                        }
                        Some(SessionCommand::RecomputeInterest { client_have, dnd, banned }) => {
                            session.recompute_interest(&client_have, &dnd, banned.as_ref());
                        }
                        Some(SessionCommand::Disconnect) | None => break,
                    }
                }
                _ = pulse.tick() => {
                    let limiter = &crate::collab::Unlimited;
                    if session.pulse(|n| limiter.can_transfer(n)).await.is_err() {
                        break;
                    }
                    self.report_stats(addr, &session);
                }
            }
        }
        self.on_peer_disconnected(&addr);
    }

    fn report_stats(&self, addr: SocketAddr, session: &PeerSession) {
        let (downloaded, uploaded, corrupted, rate_to_peer, rate_to_client, client_interested, peer_interested) =
            session.stats();
        let mut shared = self.shared.lock().unwrap();
        shared.stats.insert(
            addr,
            PeerStats {
                downloaded,
                uploaded,
                corrupted,
                rate_to_peer,
                rate_to_client,
                client_interested,
                peer_interested,
            },
        );
    }

    /// Runs one choking round: sorts connected peers by interest and
    /// rate, unchokes the configured number of downloaders plus any
    /// uninterested peer at least as fast, plus one random optimistic
    /// unchoke.
    fn run_choke_round(&self) {
        let shared = self.shared.lock().unwrap();
        let is_seed = !shared.client_have.is_empty() && shared.client_have.all();
        let snapshots: Vec<PeerSnapshot> = shared
            .peers
            .connected()
            .map(|p| {
                let stats = shared.stats.get(&p.addr).copied().unwrap_or_default();
                let rate = if is_seed {
                    stats.rate_to_peer
                } else {
                    stats.rate_to_client
                };
                PeerSnapshot {
                    addr: p.addr,
                    interested: stats.peer_interested,
                    rate,
                }
            })
            .collect();
        drop(shared);

        let mut rng = StdRng::from_entropy();
        let unchoked = choke::rechoke(snapshots, self.conf.num_downloaders_to_unchoke, &mut rng);

        let shared = self.shared.lock().unwrap();
        for peer in shared.peers.connected() {
            let choke = !unchoked.contains(&peer.addr);
            self.bridge.send(&peer.addr, SessionCommand::SetChoke(choke));
        }
    }

    /// Runs one refill round: walks the block sort order and, for each
    /// still-needed block, works down its list of known-to-have candidate
    /// peers in order until one of them actually queues the request.
    ///
    /// A candidate can decline for reasons this manager has no synchronous
    /// visibility into — it may have choked the client, or already have a
    /// full request queue — so each candidate is tried for real over its
    /// session's command channel and only an [`AddRequestOutcome::Ok`]
    /// reply ends the search for that block; any other outcome, or the
    /// session having already torn down, moves on to the next candidate.
    async fn run_refill(&self) {
        const MAX_REQUESTS_PER_TICK: usize = 200;

        let (order, peers) = {
            let shared = self.shared.lock().unwrap();
            if shared.client_have.all() {
                return;
            }
            let order = scarcity::refill_order(&shared.blocks);
            let peers: Vec<(SocketAddr, Bitfield)> = shared
                .peers
                .connected()
                .map(|p| (p.addr, p.have.clone()))
                .collect();
            (order, peers)
        };

        let mut issued = 0;
        for block_index in order {
            if issued >= MAX_REQUESTS_PER_TICK {
                break;
            }
            {
                let shared = self.shared.lock().unwrap();
                let block = &shared.blocks[block_index];
                if block.have || block.dnd {
                    continue;
                }
            }

            let (piece_index, offset_in_piece) = self.locate_block(block_index);
            let piece_len = if piece_index == self.piece_count - 1 {
                self.last_piece_len
            } else {
                self.piece_len
            };
            let index_in_piece = (offset_in_piece / BLOCK_LEN) as usize;
            let length = block_len(piece_len, index_in_piece);

            let candidates = peers
                .iter()
                .filter(|(_, have)| piece_index < have.len() && have[piece_index]);

            let mut queued = false;
            for (addr, _) in candidates {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.bridge.send(
                    addr,
                    SessionCommand::Request(piece_index, offset_in_piece, length, reply_tx),
                );
                match reply_rx.await {
                    Ok(AddRequestOutcome::Ok) => {
                        queued = true;
                        break;
                    }
                    // Missing, ClientChoked or Full: this candidate can't
                    // take the block right now, try the next one.
                    Ok(_) | Err(_) => continue,
                }
            }
            if queued {
                self.shared.lock().unwrap().blocks[block_index].bump_request_count();
                issued += 1;
            }
        }
    }

    fn locate_block(&self, block_index: usize) -> (PieceIndex, u32) {
        let mut remaining = block_index;
        for (piece, &count) in self.blocks_per_piece.iter().enumerate() {
            if remaining < count {
                return (piece, remaining as u32 * BLOCK_LEN);
            }
            remaining -= count;
        }
        (self.piece_count, 0)
    }

    /// Sends every PEX-eligible peer the current connected-peer list (each
    /// one excluding itself); each session diffs it against what it
    /// announced last tick and builds its own added/dropped payload.
    fn run_pex_tick(&self) {
        if self.conf.private {
            return;
        }
        let shared = self.shared.lock().unwrap();
        let current: Vec<(SocketAddr, u8)> = shared
            .peers
            .connected()
            .filter(|p| p.pex_enabled)
            .map(|p| (p.addr, 0u8))
            .collect();
        drop(shared);

        for &(addr, _) in &current {
            let others: Vec<(SocketAddr, u8)> =
                current.iter().filter(|(a, _)| *a != addr).cloned().collect();
            self.bridge.send(&addr, SessionCommand::PexTick(others));
        }
    }

    pub(crate) fn torrent_stats(&self) -> TorrentStats {
        let shared = self.shared.lock().unwrap();
        let have_count = shared.client_have.count_ones();
        let (downloaded, uploaded, corrupted) = shared.stats.values().fold(
            (0u64, 0u64, 0u64),
            |(d, u, c), s| (d + s.downloaded, u + s.uploaded, c + s.corrupted),
        );
        TorrentStats {
            piece_count: self.piece_count,
            have_count,
            connected_peers: shared.peers.connected_count(),
            downloaded,
            uploaded,
            corrupted,
        }
    }

    pub(crate) fn peer_stats(&self, addr: &SocketAddr) -> Option<PeerStats> {
        self.shared.lock().unwrap().stats.get(addr).copied()
    }

    /// Fills an `n`-bucket availability summary: pieces are grouped into
    /// `n` contiguous buckets (the last absorbing any remainder when
    /// `piece_count` doesn't divide evenly), each represented by its first
    /// piece. A bucket is `-1` if the client already holds that
    /// representative piece, else the count of connected peers advertising
    /// it — letting a caller grey out completed regions of the bar instead
    /// of just showing zero availability for them.
    pub(crate) fn torrent_availability(&self, n: usize) -> Vec<i32> {
        let shared = self.shared.lock().unwrap();
        let n = n.min(self.piece_count.max(1));
        (0..n)
            .map(|bucket| {
                let piece = bucket * self.piece_count / n;
                if shared.client_have[piece] {
                    return -1;
                }
                let count = shared
                    .peers
                    .connected()
                    .filter(|peer| piece < peer.have.len() && peer.have[piece])
                    .count();
                count as i32
            })
            .collect()
    }

    #[cfg(test)]
    fn mark_connected(self: &Arc<Self>, addr: SocketAddr) {
        let mut shared = self.shared.lock().unwrap();
        shared.peers.insert(addr, DiscoverySource::Incoming, self.piece_count);
        if let Some(peer) = shared.peers.get_mut(&addr) {
            peer.connected = true;
            peer.pex_enabled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::test_support::MemoryDisk;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port))
    }

    fn new_manager(piece_count: usize) -> Arc<TorrentManager> {
        let mut conf = TorrentConf::new();
        // Keep the background timers from firing mid-test.
        conf.rechoke_period = std::time::Duration::from_secs(3600);
        conf.pex_interval = std::time::Duration::from_secs(3600);
        TorrentManager::new(
            1,
            [7u8; 20],
            *crate::conf::DEFAULT_CLIENT_ID,
            None,
            piece_count,
            BLOCK_LEN,
            BLOCK_LEN,
            conf,
            Arc::new(MemoryDisk::default()),
        )
    }

    fn compact_peer(port: u16) -> Vec<u8> {
        let mut bytes = vec![127, 0, 0, 1];
        bytes.extend_from_slice(&port.to_be_bytes());
        bytes
    }

    #[tokio::test]
    async fn add_peers_parses_compact_list_and_dials_out() {
        let manager = new_manager(4);
        let mut compact = compact_peer(6001);
        compact.extend(compact_peer(6002));
        manager.add_peers(DiscoverySource::Tracker, &compact);

        // Dialing is fire-and-forget background tasks that will fail fast
        // against nothing listening; give them a tick to run and confirm
        // the peers were at least recorded in the table.
        let shared = manager.shared.lock().unwrap();
        assert_eq!(shared.peers.iter().count(), 2);
    }

    #[tokio::test]
    async fn on_peer_bitfield_updates_scarcity_and_peer_record() {
        let manager = new_manager(4);
        manager.mark_connected(addr(6001));

        let mut bits = Bitfield::new();
        bits.resize(4, false);
        bits.set(0, true);
        bits.set(2, true);

        manager.on_peer_event(addr(6001), &PeerEvent::PeerBitfield(bits.clone()));

        let shared = manager.shared.lock().unwrap();
        let peer = shared.peers.get(&addr(6001)).unwrap();
        assert_eq!(peer.have, bits);
    }

    #[tokio::test]
    async fn on_peer_have_sets_single_bit() {
        let manager = new_manager(4);
        manager.mark_connected(addr(6001));

        manager.on_peer_event(addr(6001), &PeerEvent::PeerHave(1));

        let shared = manager.shared.lock().unwrap();
        let peer = shared.peers.get(&addr(6001)).unwrap();
        assert!(peer.have[1]);
        assert!(!peer.have[0]);
    }

    #[tokio::test]
    async fn torrent_availability_counts_connected_peers_per_bucket() {
        let manager = new_manager(2);
        manager.mark_connected(addr(6001));
        manager.mark_connected(addr(6002));

        manager.on_peer_event(addr(6001), &PeerEvent::PeerHave(0));
        manager.on_peer_event(addr(6002), &PeerEvent::PeerHave(0));
        manager.on_peer_event(addr(6002), &PeerEvent::PeerHave(1));

        let availability = manager.torrent_availability(2);
        assert_eq!(availability, vec![2, 1]);
    }

    #[tokio::test]
    async fn torrent_availability_marks_held_pieces_with_sentinel() {
        let manager = new_manager(2);
        manager.mark_connected(addr(6001));
        manager.on_peer_event(addr(6001), &PeerEvent::PeerHave(0));
        manager.on_peer_event(addr(6001), &PeerEvent::PeerHave(1));
        manager.on_peer_event(addr(6001), &PeerEvent::ClientHave(0));

        let availability = manager.torrent_availability(2);
        assert_eq!(availability, vec![-1, 1]);
    }

    #[tokio::test]
    async fn on_client_have_broadcasts_have_and_recompute_interest() {
        let manager = new_manager(2);
        let mut rx = manager.bridge.register(addr(6001));
        manager.mark_connected(addr(6001));

        manager.on_peer_event(addr(6001), &PeerEvent::ClientHave(0));

        let shared = manager.shared.lock().unwrap();
        assert!(shared.client_have[0]);
        drop(shared);

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, SessionCommand::Have(0)));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, SessionCommand::RecomputeInterest { .. }));
    }

    #[tokio::test]
    async fn got_pex_registers_new_peers_unless_private() {
        let manager = new_manager(2);
        manager.on_peer_event(
            addr(6001),
            &PeerEvent::GotPex {
                added: vec![(addr(6002), 0)],
                dropped: vec![],
            },
        );
        let shared = manager.shared.lock().unwrap();
        assert!(shared.peers.get(&addr(6002)).is_some());
    }

    #[tokio::test]
    async fn got_pex_is_ignored_for_private_torrents() {
        let mut conf = TorrentConf::new();
        conf.private = true;
        let manager = TorrentManager::new(
            1,
            [7u8; 20],
            *crate::conf::DEFAULT_CLIENT_ID,
            None,
            2,
            BLOCK_LEN,
            BLOCK_LEN,
            conf,
            Arc::new(MemoryDisk::default()),
        );

        manager.on_peer_event(
            addr(6001),
            &PeerEvent::GotPex {
                added: vec![(addr(6002), 0)],
                dropped: vec![],
            },
        );
        let shared = manager.shared.lock().unwrap();
        assert!(shared.peers.get(&addr(6002)).is_none());
    }

    #[tokio::test]
    async fn peer_disconnect_unregisters_bridge_route_and_stats() {
        let manager = new_manager(2);
        let _rx = manager.bridge.register(addr(6001));
        manager.mark_connected(addr(6001));
        manager.shared.lock().unwrap().stats.insert(addr(6001), PeerStats::default());

        manager.on_peer_event(addr(6001), &PeerEvent::GotError);

        let shared = manager.shared.lock().unwrap();
        assert!(shared.peers.get(&addr(6001)).is_none());
        assert!(shared.stats.get(&addr(6001)).is_none());
        assert!(manager.bridge.registered_addrs().is_empty());
    }

    #[tokio::test]
    async fn torrent_stats_aggregates_reported_peer_totals() {
        let manager = new_manager(4);
        {
            let mut shared = manager.shared.lock().unwrap();
            shared.client_have.set(0, true);
            shared.stats.insert(
                addr(6001),
                PeerStats {
                    downloaded: 10,
                    uploaded: 5,
                    corrupted: 1,
                    ..Default::default()
                },
            );
            shared.stats.insert(
                addr(6002),
                PeerStats {
                    downloaded: 20,
                    uploaded: 0,
                    corrupted: 0,
                    ..Default::default()
                },
            );
        }
        manager.mark_connected(addr(6001));

        let stats = manager.torrent_stats();
        pretty_assertions::assert_eq!(
            stats,
            TorrentStats {
                piece_count: 4,
                have_count: 1,
                connected_peers: 1,
                downloaded: 30,
                uploaded: 5,
                corrupted: 1,
            }
        );
    }

    #[tokio::test]
    async fn peer_stats_reflects_last_reported_values() {
        let manager = new_manager(2);
        assert!(manager.peer_stats(&addr(6001)).is_none());
        manager
            .shared
            .lock()
            .unwrap()
            .stats
            .insert(addr(6001), PeerStats { downloaded: 42, ..Default::default() });
        assert_eq!(manager.peer_stats(&addr(6001)).unwrap().downloaded, 42);
    }

    #[tokio::test]
    async fn run_refill_issues_requests_only_to_peers_that_have_the_block() {
        let manager = new_manager(1);
        manager.mark_connected(addr(6001));
        manager.mark_connected(addr(6002));
        let rx1 = manager.bridge.register(addr(6001));
        let mut rx2 = manager.bridge.register(addr(6002));

        // Only peer 6002 reports having piece 0.
        manager.on_peer_event(addr(6002), &PeerEvent::PeerHave(0));

        // Stand in for peer 6002's session task: answer its one expected
        // Request with Ok so run_refill's await resolves.
        let responder = tokio::spawn(async move {
            match rx2.recv().await {
                Some(SessionCommand::Request(piece, offset, _length, reply)) => {
                    let _ = reply.send(AddRequestOutcome::Ok);
                    Some((piece, offset))
                }
                _ => None,
            }
        });

        manager.run_refill().await;

        assert_eq!(responder.await.unwrap(), Some((0, 0)));
        drop(rx1);
    }

    #[tokio::test]
    async fn run_refill_falls_back_to_the_next_candidate_when_the_first_declines() {
        let manager = new_manager(1);
        manager.mark_connected(addr(6001));
        manager.mark_connected(addr(6002));
        let mut rx1 = manager.bridge.register(addr(6001));
        let mut rx2 = manager.bridge.register(addr(6002));

        // Both peers report having piece 0; 6001 is tried first (insertion
        // order) but declines, so run_refill must move on to 6002.
        manager.on_peer_event(addr(6001), &PeerEvent::PeerHave(0));
        manager.on_peer_event(addr(6002), &PeerEvent::PeerHave(0));

        let decliner = tokio::spawn(async move {
            match rx1.recv().await {
                Some(SessionCommand::Request(_, _, _, reply)) => {
                    let _ = reply.send(AddRequestOutcome::ClientChoked);
                }
                _ => {}
            }
        });
        let accepter = tokio::spawn(async move {
            match rx2.recv().await {
                Some(SessionCommand::Request(piece, offset, _length, reply)) => {
                    let _ = reply.send(AddRequestOutcome::Ok);
                    Some((piece, offset))
                }
                _ => None,
            }
        });

        manager.run_refill().await;

        decliner.await.unwrap();
        assert_eq!(accepter.await.unwrap(), Some((0, 0)));
    }

    #[tokio::test]
    async fn run_refill_is_a_noop_once_client_has_everything() {
        let manager = new_manager(1);
        manager.mark_connected(addr(6001));
        manager.shared.lock().unwrap().client_have.set(0, true);

        let mut rx = manager.bridge.register(addr(6001));
        manager.run_refill().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_pex_tick_excludes_the_recipient_from_its_own_list() {
        let manager = new_manager(1);
        manager.mark_connected(addr(6001));
        manager.mark_connected(addr(6002));
        let mut rx1 = manager.bridge.register(addr(6001));

        manager.run_pex_tick();

        match rx1.try_recv().unwrap() {
            SessionCommand::PexTick(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].0, addr(6002));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn on_client_block_triggers_verification_once_piece_is_whole() {
        let manager = new_manager(1);
        let mut rx = manager.bridge.register(addr(6001));
        manager.mark_connected(addr(6001));

        let blocks = manager.blocks_per_piece[0];
        for i in 0..blocks {
            manager.on_peer_event(
                addr(6001),
                &PeerEvent::ClientBlock {
                    piece_index: 0,
                    offset: i as u32 * BLOCK_LEN,
                    length: BLOCK_LEN,
                },
            );
        }

        // Verification is spawned onto its own task; give it a chance to run.
        for _ in 0..50 {
            if let Ok(cmd) = rx.try_recv() {
                assert!(matches!(cmd, SessionCommand::PieceVerified(0, true)));
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected a PieceVerified command after the piece completed");
    }
}
