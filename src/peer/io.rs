//! Owns a peer's TCP socket and applies plaintext or RC4 encryption
//! transparently to whatever is read from or written to it.
//!
//! `PeerIo`'s read/write helpers are plain `async fn`s built on Tokio:
//! a caller that "needs more bytes" simply awaits them. The handshake
//! engine (`handshake.rs`) drives these directly during the MSE preamble;
//! once the connection is past the handshake, it is wrapped in a
//! `tokio_util::codec::Framed` (`codec.rs`) which takes over framing and
//! calls back into the same encryption machinery through `PeerIo`'s
//! buffer-oriented helpers.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::counter::RateCounter;
use crate::crypto::Rc4Stream;
use crate::error::Result;
use crate::Sha1Hash;

/// Which transformation, if any, is applied to bytes crossing the wire.
pub(crate) enum EncryptionMode {
    Plaintext,
    Rc4 {
        encrypt: Box<Rc4Stream>,
        decrypt: Box<Rc4Stream>,
    },
}

/// A peer's live TCP connection plus its encryption state and byte-rate
/// counters.
///
/// There is at most one `PeerIo` per connected peer, and it is owned
/// first by the handshake engine and then, on success, handed off to the
/// protocol engine (`session.rs`) — never both at once, matching the
/// ownership invariant in the data model.
pub(crate) struct PeerIo {
    socket: TcpStream,
    addr: SocketAddr,
    mode: EncryptionMode,
    /// Known once the MSE responder resolves which torrent an incoming
    /// connection is for, or once an outgoing connection's handshake
    /// completes.
    torrent_hash: Option<Sha1Hash>,
    upload_rate: RateCounter,
    download_rate: RateCounter,
}

impl PeerIo {
    /// Opens a new outbound TCP connection to `addr`.
    pub(crate) async fn connect(addr: SocketAddr) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true).ok();
        Ok(Self::from_socket(socket, addr))
    }

    /// Wraps an already-accepted inbound socket.
    pub(crate) fn from_accepted(socket: TcpStream, addr: SocketAddr) -> Self {
        Self::from_socket(socket, addr)
    }

    fn from_socket(socket: TcpStream, addr: SocketAddr) -> Self {
        Self {
            socket,
            addr,
            mode: EncryptionMode::Plaintext,
            torrent_hash: None,
            upload_rate: RateCounter::new(),
            download_rate: RateCounter::new(),
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drops the current socket and redials the same address, preserving
    /// everything else about this session. Used by the MSE fallback path
    /// when an encrypted handshake attempt fails partway through.
    pub(crate) async fn reconnect(&mut self) -> Result<()> {
        let socket = TcpStream::connect(self.addr).await?;
        socket.set_nodelay(true).ok();
        self.socket = socket;
        self.mode = EncryptionMode::Plaintext;
        Ok(())
    }

    pub(crate) fn set_encryption(&mut self, mode: EncryptionMode) {
        self.mode = mode;
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        matches!(self.mode, EncryptionMode::Rc4 { .. })
    }

    pub(crate) fn set_torrent_hash(&mut self, hash: Sha1Hash) {
        self.torrent_hash = Some(hash);
    }

    pub(crate) fn has_torrent_hash(&self) -> bool {
        self.torrent_hash.is_some()
    }

    pub(crate) fn torrent_hash(&self) -> Option<Sha1Hash> {
        self.torrent_hash
    }

    /// Estimated upload rate to this peer, in bytes/second.
    pub(crate) fn rate_to_peer(&self) -> f64 {
        self.upload_rate.rate()
    }

    /// Estimated download rate from this peer, in bytes/second.
    pub(crate) fn rate_to_client(&self) -> f64 {
        self.download_rate.rate()
    }

    /// Writes `bytes` to the socket, encrypting first if RC4 mode is
    /// active. Used for raw handshake traffic; once framed, the codec
    /// calls [`PeerIo::encrypt_outgoing`]/[`PeerIo::decrypt_incoming`]
    /// directly on its own buffers instead.
    pub(crate) async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut buf = bytes.to_vec();
        self.encrypt_outgoing(&mut buf);
        self.socket.write_all(&buf).await?;
        self.upload_rate.update(buf.len() as u32);
        Ok(())
    }

    pub(crate) async fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write(&value.to_be_bytes()).await
    }

    pub(crate) async fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write(&value.to_be_bytes()).await
    }

    /// Reads exactly `n` bytes from the socket, decrypting in place if RC4
    /// mode is active.
    pub(crate) async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.socket.read_exact(&mut buf).await?;
        self.decrypt_incoming(&mut buf);
        self.download_rate.update(n as u32);
        Ok(buf)
    }

    pub(crate) async fn read_u16(&mut self) -> Result<u16> {
        let buf = self.read_bytes(2).await?;
        Ok(u16::from_be_bytes([buf[0], buf[1]]))
    }

    pub(crate) async fn read_u32(&mut self) -> Result<u32> {
        let buf = self.read_bytes(4).await?;
        Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }

    /// Encrypts `buf` in place if the session is in RC4 mode; a no-op in
    /// plaintext mode.
    pub(crate) fn encrypt_outgoing(&mut self, buf: &mut [u8]) {
        if let EncryptionMode::Rc4 { encrypt, .. } = &mut self.mode {
            encrypt.apply_keystream(buf);
        }
    }

    /// Decrypts `buf` in place if the session is in RC4 mode; a no-op in
    /// plaintext mode.
    pub(crate) fn decrypt_incoming(&mut self, buf: &mut [u8]) {
        if let EncryptionMode::Rc4 { decrypt, .. } = &mut self.mode {
            decrypt.apply_keystream(buf);
        }
    }

    /// Splits this `PeerIo` into its raw socket (for handing to a
    /// `Framed` codec) and the encryption/rate-tracking state, which the
    /// codec consults on every frame it reads or writes.
    pub(crate) fn into_parts(self) -> (TcpStream, PeerIoState) {
        (
            self.socket,
            PeerIoState {
                addr: self.addr,
                mode: self.mode,
                torrent_hash: self.torrent_hash,
                upload_rate: self.upload_rate,
                download_rate: self.download_rate,
            },
        )
    }

    pub(crate) fn record_upload(&mut self, n: u32) {
        self.upload_rate.update(n);
    }

    pub(crate) fn record_download(&mut self, n: u32) {
        self.download_rate.update(n);
    }
}

/// The non-socket half of [`PeerIo`], retained by the protocol engine
/// after the socket itself has been wrapped in a `Framed` codec.
pub(crate) struct PeerIoState {
    pub(crate) addr: SocketAddr,
    pub(crate) mode: EncryptionMode,
    pub(crate) torrent_hash: Option<Sha1Hash>,
    pub(crate) upload_rate: RateCounter,
    pub(crate) download_rate: RateCounter,
}

impl PeerIoState {
    pub(crate) fn rate_to_peer(&self) -> f64 {
        self.upload_rate.rate()
    }

    pub(crate) fn rate_to_client(&self) -> f64 {
        self.download_rate.rate()
    }

    pub(crate) fn encrypt_outgoing(&mut self, buf: &mut [u8]) {
        if let EncryptionMode::Rc4 { encrypt, .. } = &mut self.mode {
            encrypt.apply_keystream(buf);
        }
    }

    pub(crate) fn decrypt_incoming(&mut self, buf: &mut [u8]) {
        if let EncryptionMode::Rc4 { decrypt, .. } = &mut self.mode {
            decrypt.apply_keystream(buf);
        }
    }

    pub(crate) fn record_upload(&mut self, n: u32) {
        self.upload_rate.update(n);
    }

    pub(crate) fn record_download(&mut self, n: u32) {
        self.download_rate.update(n);
    }
}
