//! The per-peer protocol engine: frames BT messages, keeps the
//! choke/interest flags and request queues, serves blocks to the peer and
//! accepts blocks from it, and publishes domain events for the owning
//! torrent's peer manager to react to.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::collab::DiskIo;
use crate::error::Error;
use crate::event::{PeerEvent, Publisher};
use crate::peer::codec::PeerCodec;
use crate::peer::ltep::{self, LTEP_HANDSHAKE_SUB_ID, UT_PEX_LOCAL_ID};
use crate::peer::message::{BlockRequest, Message};
use crate::{Bitfield, PieceIndex, Sha1Hash, TorrentId};

/// The outcome of [`PeerSession::add_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddRequestOutcome {
    Ok,
    Missing,
    ClientChoked,
    Full,
}

/// Number of outstanding requests at or below which a `BlocksRunningLow`
/// event is published so the refill scheduler can be armed.
const LOW_REQUESTS: usize = 2;

/// Maximum bytes of piece data written to the socket per pulse.
const PULSE_WRITE_BUDGET: usize = 1024;

/// The request-queue cap, scaled to the measured download rate from this
/// peer rather than a fixed constant.
fn request_cap(rate_to_client: f64, max_cap: usize) -> usize {
    let adaptive = 2.0 + rate_to_client / 10.0;
    (adaptive as usize).min(max_cap).max(2)
}

/// Bounds-checked bit read, since an out-of-range index should mean "no",
/// not a panic.
fn bit_at(bits: &Bitfield, index: usize) -> bool {
    index < bits.len() && bits[index]
}

pub(crate) struct PeerSession {
    addr: SocketAddr,
    torrent: TorrentId,
    info_hash: Sha1Hash,
    block_len: u32,
    piece_count: usize,
    private: bool,

    framed: Framed<TcpStream, PeerCodec>,
    disk: Arc<dyn DiskIo>,
    publisher: Arc<Publisher>,

    peer_choked: bool,
    client_choked: bool,
    peer_interested: bool,
    client_interested: bool,

    peer_have: Bitfield,

    peer_asked_for: VecDeque<BlockRequest>,
    client_asked_for: Vec<(BlockRequest, Instant)>,

    outgoing_messages: VecDeque<Message>,
    outgoing_block: Option<OutgoingBlock>,

    last_keepalive: Instant,

    ut_pex_id: Option<u8>,
    pex_enabled: bool,
    last_pex_peers: Vec<(SocketAddr, u8)>,

    downloaded_bytes: u64,
    uploaded_bytes: u64,
    corrupted_bytes: u64,
    /// Bytes received from this peer toward each piece still awaiting hash
    /// verification, so a failed verification can move exactly those bytes
    /// from `downloaded_bytes` to `corrupted_bytes` rather than guessing.
    pending_piece_bytes: HashMap<PieceIndex, u64>,

    max_request_cap: usize,
}

struct OutgoingBlock {
    request: BlockRequest,
    data: Vec<u8>,
    sent: usize,
}

impl PeerSession {
    pub(crate) fn new(
        addr: SocketAddr,
        torrent: TorrentId,
        info_hash: Sha1Hash,
        block_len: u32,
        piece_count: usize,
        private: bool,
        framed: Framed<TcpStream, PeerCodec>,
        disk: Arc<dyn DiskIo>,
        publisher: Arc<Publisher>,
        max_request_cap: usize,
    ) -> Self {
        let mut peer_have = Bitfield::new();
        peer_have.resize(piece_count, false);
        Self {
            addr,
            torrent,
            info_hash,
            block_len,
            piece_count,
            private,
            framed,
            disk,
            publisher,
            peer_choked: true,
            client_choked: true,
            peer_interested: false,
            client_interested: false,
            peer_have,
            peer_asked_for: VecDeque::new(),
            client_asked_for: Vec::new(),
            outgoing_messages: VecDeque::new(),
            outgoing_block: None,
            last_keepalive: Instant::now(),
            ut_pex_id: None,
            pex_enabled: false,
            last_pex_peers: Vec::new(),
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            corrupted_bytes: 0,
            pending_piece_bytes: HashMap::new(),
            max_request_cap,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn client_choked(&self) -> bool {
        self.client_choked
    }

    pub(crate) fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub(crate) fn rate_to_client(&self) -> f64 {
        self.framed.codec().io.rate_to_client()
    }

    pub(crate) fn rate_to_peer(&self) -> f64 {
        self.framed.codec().io.rate_to_peer()
    }

    /// Reads and dispatches the next message from the socket. Returns
    /// `Ok(false)` on a clean disconnect.
    pub(crate) async fn poll_message(&mut self) -> crate::error::Result<bool> {
        match self.framed.next().await {
            Some(msg) => {
                let msg = msg?;
                self.handle_message(msg).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn handle_message(&mut self, msg: Message) -> crate::error::Result<()> {
        match msg {
            Message::KeepAlive => {
                self.last_keepalive = Instant::now();
            }
            Message::Choke => {
                if !self.client_choked {
                    self.client_choked = true;
                    self.client_asked_for.clear();
                }
            }
            Message::Unchoke => {
                self.client_choked = false;
            }
            Message::Interested => {
                self.peer_interested = true;
            }
            Message::NotInterested => {
                self.peer_interested = false;
            }
            Message::Have(piece) => {
                if piece < self.peer_have.len() && !bit_at(&self.peer_have, piece) {
                    self.peer_have.set(piece, true);
                    self.publisher
                        .publish(self.addr, PeerEvent::PeerHave(piece));
                }
            }
            Message::Bitfield(mut bits) => {
                // The wire form is padded out to a whole byte, so the
                // received bit count must be the piece count rounded up to
                // the nearest multiple of 8; anything else is a peer lying
                // about how many pieces exist and is fatal for the session.
                let expected_bits = (self.piece_count + 7) / 8 * 8;
                if bits.len() != expected_bits {
                    return Err(Error::BitfieldLengthMismatch);
                }
                bits.resize(self.piece_count, false);
                self.peer_have = bits.clone();
                self.publisher
                    .publish(self.addr, PeerEvent::PeerBitfield(bits));
            }
            Message::Request(req) => {
                if !self.peer_choked {
                    self.peer_asked_for.push_back(req);
                }
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.got_block(piece_index, offset, data).await?;
            }
            Message::Cancel(req) => {
                self.peer_asked_for.retain(|r| *r != req);
            }
            Message::Port(_port) => {
                // DHT is out of scope for this crate; the value is
                // accepted but otherwise unused.
            }
            Message::Extended { sub_id, payload } => {
                self.handle_extended(sub_id, payload).await?;
            }
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        sub_id: u8,
        payload: Vec<u8>,
    ) -> crate::error::Result<()> {
        if sub_id == LTEP_HANDSHAKE_SUB_ID {
            let handshake = ltep::decode_handshake(&payload)?;
            self.ut_pex_id = handshake.ut_pex_id;
            self.pex_enabled = handshake.ut_pex_id.is_some() && !self.private;
            return Ok(());
        }

        if self.private {
            // A private torrent never processes PEX, regardless of what
            // sub-id the peer used.
            return Ok(());
        }

        // Peers send us ut_pex messages using the sub-id *we* advertised
        // in our own handshake `m` dictionary, not the one they chose for
        // themselves (that one is for messages going the other way).
        if self.ut_pex_id.is_some() && sub_id == UT_PEX_LOCAL_ID as u8 {
            let pex = ltep::decode_pex(&payload)?;
            self.publisher.publish(
                self.addr,
                PeerEvent::GotPex {
                    added: pex.added,
                    dropped: pex.dropped,
                },
            );
        }
        Ok(())
    }

    /// Appends a REQUEST to `client_asked_for` and queues the wire
    /// message, enforcing the rate-adaptive cap.
    pub(crate) fn add_request(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> AddRequestOutcome {
        if self.client_choked {
            return AddRequestOutcome::ClientChoked;
        }
        if !bit_at(&self.peer_have, piece_index) {
            return AddRequestOutcome::Missing;
        }
        let cap = request_cap(self.rate_to_client(), self.max_request_cap);
        if self.client_asked_for.len() >= cap {
            return AddRequestOutcome::Full;
        }

        let req = BlockRequest {
            piece_index,
            offset,
            length,
        };
        self.client_asked_for.push((req, Instant::now()));
        self.outgoing_messages.push_back(Message::Request(req));
        AddRequestOutcome::Ok
    }

    /// Processes a received block: validates it against a pending
    /// request, writes it to disk, and on piece completion triggers
    /// verification.
    async fn got_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> crate::error::Result<()> {
        let pos = self.client_asked_for.iter().position(|(r, _)| {
            r.piece_index == piece_index
                && r.offset == offset
                && r.length as usize == data.len()
        });

        let pos = match pos {
            Some(pos) => pos,
            None => {
                // Duplicate or unrequested block: bytes are discarded and
                // counted as corrupted.
                self.corrupted_bytes += data.len() as u64;
                return Ok(());
            }
        };
        self.client_asked_for.remove(pos);

        self.disk
            .io_write(self.torrent, piece_index, offset, &data)
            .await?;
        self.downloaded_bytes += data.len() as u64;
        *self.pending_piece_bytes.entry(piece_index).or_insert(0) += data.len() as u64;

        self.publisher.publish(
            self.addr,
            PeerEvent::ClientBlock {
                piece_index,
                offset,
                length: data.len() as u32,
            },
        );

        if self.client_asked_for.len() <= LOW_REQUESTS {
            self.publisher
                .publish(self.addr, PeerEvent::BlocksRunningLow);
        }

        Ok(())
    }

    /// Called by the peer manager once it has verified a piece's hash
    /// (via the disk collaborator), to let the session announce it and
    /// record blame.
    pub(crate) fn on_piece_verified(&mut self, piece_index: PieceIndex, ok: bool) {
        let bytes_from_this_peer = self.pending_piece_bytes.remove(&piece_index).unwrap_or(0);
        if ok {
            self.publisher
                .publish(self.addr, PeerEvent::ClientHave(piece_index));
        } else {
            // Hash mismatch: the bytes already counted toward
            // `downloaded` move to `corrupted`; the peer manager is
            // responsible for any banning policy.
            self.downloaded_bytes = self.downloaded_bytes.saturating_sub(bytes_from_this_peer);
            self.corrupted_bytes += bytes_from_this_peer;
        }
    }

    /// Updates `client_interested` after any change in our own or the
    /// peer's pieces, sending INTERESTED/NOT_INTERESTED only if the flag
    /// flipped.
    pub(crate) fn recompute_interest(
        &mut self,
        client_has: &Bitfield,
        dnd: &Bitfield,
        banned: Option<&Bitfield>,
    ) {
        let mut interested = false;
        for i in 0..self.piece_count {
            let peer_has = bit_at(&self.peer_have, i);
            let we_have = bit_at(client_has, i);
            let is_dnd = bit_at(dnd, i);
            let is_banned = banned.map(|b| bit_at(b, i)).unwrap_or(false);
            if peer_has && !we_have && !is_dnd && !is_banned {
                interested = true;
                break;
            }
        }

        if interested != self.client_interested {
            self.client_interested = interested;
            self.outgoing_messages.push_back(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    /// Sends a CHOKE/UNCHOKE to the peer if it isn't already in that
    /// state, per the idempotence law that repeated calls send at most
    /// one message.
    pub(crate) fn queue_set_choke(&mut self, choke: bool) {
        if choke == self.peer_choked {
            return;
        }
        self.peer_choked = choke;
        if choke {
            self.peer_asked_for.clear();
        }
        self.outgoing_messages
            .push_back(if choke { Message::Choke } else { Message::Unchoke });
    }

    pub(crate) fn queue_have(&mut self, piece: PieceIndex) {
        self.outgoing_messages.push_back(Message::Have(piece));
    }

    pub(crate) fn queue_bitfield(&mut self, bitfield: Bitfield) {
        self.outgoing_messages
            .push_front(Message::Bitfield(bitfield));
    }

    /// Runs one pulse (default every 50ms): serves up to 1 KiB of
    /// in-flight piece data, else flushes queued control messages, else
    /// starts serving the next queued request; finally checks the
    /// low-water mark.
    pub(crate) async fn pulse(
        &mut self,
        can_upload: impl Fn(u32) -> bool,
    ) -> crate::error::Result<()> {
        if let Some(block) = &mut self.outgoing_block {
            // The wire codec only knows how to write a whole PIECE message
            // at once, so pacing works by spreading the budget across
            // pulses and only flushing the frame once the block's full
            // byte budget has been earned.
            if can_upload(PULSE_WRITE_BUDGET as u32) {
                let remaining = block.data.len() - block.sent;
                let take = remaining.min(PULSE_WRITE_BUDGET);
                block.sent += take;
                self.uploaded_bytes += take as u64;

                if block.sent >= block.data.len() {
                    let finished = self.outgoing_block.take().unwrap();
                    self.framed
                        .send(Message::Piece {
                            piece_index: finished.request.piece_index,
                            offset: finished.request.offset,
                            data: finished.data,
                        })
                        .await?;
                }
            }
            return self.maybe_publish_low_requests();
        }

        if let Some(msg) = self.outgoing_messages.pop_front() {
            self.framed.send(msg).await?;
            return self.maybe_publish_low_requests();
        }

        if let Some(req) = self.peer_asked_for.pop_front() {
            let data = self
                .disk
                .io_read(self.torrent, req.piece_index, req.offset, req.length)
                .await?;
            self.outgoing_block = Some(OutgoingBlock {
                request: req,
                data,
                sent: 0,
            });
        }

        self.maybe_publish_low_requests()
    }

    fn maybe_publish_low_requests(&self) -> crate::error::Result<()> {
        if self.client_asked_for.len() <= LOW_REQUESTS {
            self.publisher
                .publish(self.addr, PeerEvent::BlocksRunningLow);
        }
        Ok(())
    }

    /// Builds and sends a PEX diff against `current_peers`, capping the
    /// added/dropped lists at 50 entries each, then remembers what was
    /// sent for next tick's diff.
    pub(crate) async fn pex_tick(
        &mut self,
        current_peers: &[(SocketAddr, u8)],
    ) -> crate::error::Result<()> {
        if self.private || !self.pex_enabled {
            return Ok(());
        }

        let previous: std::collections::HashSet<SocketAddr> =
            self.last_pex_peers.iter().map(|(a, _)| *a).collect();
        let current: std::collections::HashSet<SocketAddr> =
            current_peers.iter().map(|(a, _)| *a).collect();

        let added: Vec<(SocketAddr, u8)> = current_peers
            .iter()
            .filter(|(a, _)| !previous.contains(a))
            .cloned()
            .collect();
        let dropped: Vec<SocketAddr> = self
            .last_pex_peers
            .iter()
            .filter(|(a, _)| !current.contains(a))
            .map(|(a, _)| *a)
            .collect();

        if added.is_empty() && dropped.is_empty() {
            return Ok(());
        }

        let payload = ltep::encode_pex(&added, &dropped);
        let sub_id = self.ut_pex_id.unwrap_or(UT_PEX_LOCAL_ID as u8);
        self.framed
            .send(Message::Extended { sub_id, payload })
            .await?;

        self.last_pex_peers = current_peers.to_vec();
        Ok(())
    }

    pub(crate) fn stats(
        &self,
    ) -> (u64, u64, u64, f64, f64, bool, bool) {
        (
            self.downloaded_bytes,
            self.uploaded_bytes,
            self.corrupted_bytes,
            self.rate_to_peer(),
            self.rate_to_client(),
            self.client_interested,
            self.peer_interested,
        )
    }
}
