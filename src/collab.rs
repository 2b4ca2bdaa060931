//! Collaborator interfaces consumed by the peer subsystem but implemented
//! elsewhere in a full client: the on-disk piece store, the torrent
//! lookup used to resolve incoming connections, and the rate limiter.
//!
//! These are modeled as traits so the peer protocol engine and peer
//! manager stay testable in isolation (see the in-memory stubs in each
//! module's test code) while a real client wires up a disk-backed
//! implementation such as [`crate::disk`].

use async_trait::async_trait;

use crate::{PieceIndex, Sha1Hash, TorrentId};

/// Disk IO operations the peer protocol engine needs: reading a block to
/// serve a REQUEST, writing a received block, and hashing a completed
/// piece.
#[async_trait]
pub trait DiskIo: Send + Sync {
    async fn io_read(
        &self,
        torrent: TorrentId,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> crate::error::Result<Vec<u8>>;

    async fn io_write(
        &self,
        torrent: TorrentId,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> crate::error::Result<()>;

    async fn io_hash(
        &self,
        torrent: TorrentId,
        piece: PieceIndex,
    ) -> crate::error::Result<bool>;
}

/// A simple token-bucket-style rate limiter collaborator.
pub trait RateControl: Send + Sync {
    fn can_transfer(&self, n: u32) -> bool;
    fn transferred(&self, n: u32);
}

/// An unlimited rate control used in tests and as the engine default when
/// no limit is configured.
pub struct Unlimited;

impl RateControl for Unlimited {
    fn can_transfer(&self, _n: u32) -> bool {
        true
    }
    fn transferred(&self, _n: u32) {}
}

/// Looks up a registered torrent by its canonical or obfuscated info hash.
/// Implemented by the peer manager's torrent table and consumed by the
/// MSE responder path to resolve which torrent an incoming connection is
/// asking about.
pub trait TorrentLookup: Send + Sync {
    fn find_torrent_by_hash(&self, hash: &Sha1Hash) -> Option<TorrentId>;
    fn find_torrent_by_obfuscated_hash(
        &self,
        obfuscated: &Sha1Hash,
    ) -> Option<(TorrentId, Sha1Hash)>;
}
