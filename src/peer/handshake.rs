//! The Message Stream Encryption handshake, followed by the plaintext
//! BitTorrent handshake and, if negotiated, the LTEP extension handshake.
//!
//! This module drives the byte stream directly through [`PeerIo`]'s raw
//! read/write helpers for the whole MSE preamble (there is no framing to
//! speak of before both sides have agreed on an encryption mode), then
//! switches the underlying socket over to `tokio_util::codec::Framed` for
//! the 68-byte BT handshake and, from there, the regular message stream,
//! handing the connection off between `HandshakeCodec` and `PeerCodec`.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio_util::codec::{Framed, FramedParts};

use crate::crypto::{sha1, xor20, DhKeyPair, Rc4Stream};
use crate::error::{Error, Result};
use crate::peer::codec::{
    Handshake, HandshakeCodec, PeerCodec, RESERVED_LTEP_BIT,
};
use crate::peer::io::{EncryptionMode, PeerIo, PeerIoState};
use crate::peer::ltep::{self, ExtendedHandshake, LTEP_HANDSHAKE_SUB_ID};
use crate::peer::message::Message;
use crate::{PeerId, Sha1Hash};

/// Our willingness to speak encrypted, plaintext, or either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPreference {
    EncryptionPreferred,
    EncryptionRequired,
    PlaintextPreferred,
    PlaintextRequired,
}

impl EncryptionPreference {
    /// The 4-byte `crypto_provide` bitmask we advertise: bit 0 is
    /// plaintext, bit 1 is RC4; never zero, never above 3.
    fn crypto_provide(self) -> u32 {
        match self {
            EncryptionPreference::EncryptionRequired => 0b10,
            EncryptionPreference::EncryptionPreferred => 0b11,
            EncryptionPreference::PlaintextPreferred => 0b11,
            EncryptionPreference::PlaintextRequired => 0b01,
        }
    }

    fn wants_encryption(self) -> bool {
        matches!(
            self,
            EncryptionPreference::EncryptionPreferred
                | EncryptionPreference::EncryptionRequired
        )
    }

    fn requires_encryption(self) -> bool {
        matches!(self, EncryptionPreference::EncryptionRequired)
    }
}

/// The 20-byte literal that prefixes a plaintext BT handshake, used by
/// the initiator to detect that a peer skipped MSE entirely and replied
/// with a plaintext handshake instead of `Yb`.
const PLAINTEXT_MARKER: &[u8; 20] = b"\x13BitTorrent protocol";

pub(crate) struct HandshakeOutcome {
    pub(crate) framed: Framed<tokio::net::TcpStream, PeerCodec>,
    pub(crate) peer_id: PeerId,
    pub(crate) extended: Option<ExtendedHandshake>,
}

/// Drives the full outbound (initiator) handshake: MSE negotiation (with
/// the one-shot plaintext fallback), the BT handshake, and LTEP if both
/// sides advertised it.
pub(crate) async fn outbound(
    mut io: PeerIo,
    info_hash: Sha1Hash,
    client_id: PeerId,
    listen_port: Option<u16>,
    mut preference: EncryptionPreference,
) -> Result<HandshakeOutcome> {
    loop {
        if !preference.wants_encryption() {
            // No MSE: the BT handshake hasn't been sent yet, and the peer's
            // hasn't been read yet either.
            return finish_bt_handshake(
                io, info_hash, client_id, listen_port, true, None,
            )
            .await;
        }

        match encrypted_outbound(&mut io, info_hash, client_id, preference).await {
            Ok(()) => {
                // Our BT handshake already went out inside `IA`; only the
                // peer's own handshake still needs to be read.
                return finish_bt_handshake(
                    io, info_hash, client_id, listen_port, false, None,
                )
                .await;
            }
            Err(e) if !preference.requires_encryption() => {
                log::info!(
                    "Falling back to plaintext handshake with {} after {}",
                    io.addr(),
                    e
                );
                io.reconnect().await?;
                preference = EncryptionPreference::PlaintextRequired;
                // Loop back around and take the `!wants_encryption()` branch.
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs the MSE initiator exchange (`AWAITING_YB -> AWAITING_VC ->
/// AWAITING_CRYPTO_SELECT -> AWAITING_PAD_D`) and leaves `io` configured
/// with the negotiated encryption mode, ready for the plaintext-shaped BT
/// handshake that follows.
async fn encrypted_outbound(
    io: &mut PeerIo,
    info_hash: Sha1Hash,
    client_id: PeerId,
    preference: EncryptionPreference,
) -> Result<()> {
    let dh = DhKeyPair::generate();
    let ya = dh.public_key();

    let pad_a = {
        let mut rng = rand::thread_rng();
        let pad_a_len = rng.gen_range(0..512);
        let mut pad_a = vec![0u8; pad_a_len];
        rng.fill(&mut pad_a[..]);
        pad_a
    };

    io.write(&ya).await?;
    io.write(&pad_a).await?;

    // AWAITING_YB: Yb is 96 bytes; if the peer sent a plaintext handshake
    // instead, its first 20 bytes equal the BT protocol literal.
    let yb_or_plain = io.read_bytes(96).await?;
    if &yb_or_plain[0..20] == PLAINTEXT_MARKER {
        // The peer doesn't speak MSE; there's nothing to negotiate, so
        // this is reported as an error so the outer loop retries with
        // plaintext from a fresh connection (the bytes already read
        // can't cleanly be spliced back in without a dedicated resumable
        // handshake codec, so a reconnect is simplest and matches the
        // fallback path already required for `EncryptionPreferred`).
        return Err(Error::InvalidCryptoSelect);
    }
    let mut yb = [0u8; 96];
    yb.copy_from_slice(&yb_or_plain);

    let secret = dh.shared_secret(&yb);

    let req1 = sha1(&[b"req1", &secret]);
    let req2 = sha1(&[b"req2", &info_hash]);
    let req3 = sha1(&[b"req3", &secret]);
    let obfuscated_hash = xor20(&req2, &req3);

    let enc_key = sha1(&[b"keyA", &secret, &info_hash]);
    let dec_key = sha1(&[b"keyB", &secret, &info_hash]);
    let mut encrypt = Rc4Stream::new(&enc_key);
    let decrypt = Rc4Stream::new(&dec_key);

    let vc = [0u8; 8];
    let crypto_provide = preference.crypto_provide();
    let pad_c = {
        let mut rng = rand::thread_rng();
        let pad_c_len = rng.gen_range(0..512);
        let mut pad_c = vec![0u8; pad_c_len];
        rng.fill(&mut pad_c[..]);
        pad_c
    };

    let ia = Handshake::new(info_hash, client_id).to_bytes();

    let mut payload = Vec::new();
    payload.extend_from_slice(&vc);
    payload.extend_from_slice(&crypto_provide.to_be_bytes());
    payload.extend_from_slice(&(pad_c.len() as u16).to_be_bytes());
    payload.extend_from_slice(&pad_c);
    payload.extend_from_slice(&(ia.len() as u16).to_be_bytes());
    payload.extend_from_slice(&ia);
    encrypt.apply_keystream(&mut payload);

    io.write(&req1).await?;
    let mut obfuscated_payload = [0u8; 20];
    obfuscated_payload.copy_from_slice(&obfuscated_hash);
    io.write(&obfuscated_payload).await?;
    io.write(&payload).await?;

    // AWAITING_VC: resync on the 8-byte zero VC after decryption,
    // dropping one byte at a time if it isn't found immediately (the
    // responder may itself have sent pad bytes we don't know the length
    // of ahead of time — in practice PadB is bounded, so this terminates
    // quickly in the common case).
    io.set_encryption(EncryptionMode::Rc4 {
        encrypt: Box::new(encrypt),
        decrypt: Box::new(decrypt),
    });
    resync_on_vc(io).await?;

    // AWAITING_CRYPTO_SELECT
    let crypto_select = io.read_u32().await?;
    let pad_d_len = io.read_u16().await? as usize;
    let _pad_d = io.read_bytes(pad_d_len).await?;

    match crypto_select {
        1 => io.set_encryption(EncryptionMode::Plaintext),
        2 => {
            // Already set to RC4 above; nothing further to do.
        }
        _ => return Err(Error::InvalidCryptoSelect),
    }

    Ok(())
}

/// Scans the incoming stream, one byte at a time, until the last 8 bytes
/// decrypt to all zero (`VC`); the responder's own padding is of unknown
/// length, so this must resync byte by byte rather than assuming an
/// exact offset.
async fn resync_on_vc(io: &mut PeerIo) -> Result<()> {
    const MAX_SCAN: usize = 512 + 8;
    let mut window = Vec::with_capacity(8);
    for _ in 0..MAX_SCAN {
        let byte = io.read_bytes(1).await?;
        window.push(byte[0]);
        if window.len() > 8 {
            window.remove(0);
        }
        if window.len() == 8 && window.iter().all(|&b| b == 0) {
            return Ok(());
        }
    }
    Err(Error::InvalidCryptoSelect)
}

/// Finishes the handshake by exchanging the 68-byte BT handshake over a
/// `Framed<_, HandshakeCodec>` built from `io`'s current encryption mode,
/// then the LTEP extension handshake if both sides advertised it, then
/// rewraps the socket in a `Framed<_, PeerCodec>` for steady-state
/// message exchange — mirroring the codec hand-off.
///
/// `send_handshake` is false when the caller already embedded the 68 bytes
/// elsewhere (the outbound `IA` field carries them for the initiator, so
/// they must not go out a second time as their own message). `peer_handshake`
/// is `Some` when the caller already has the peer's handshake in hand
/// (decoded out of `IA`, or read while peeking the connection's first bytes)
/// and this function must not block trying to read a second one that will
/// never arrive.
async fn finish_bt_handshake(
    io: PeerIo,
    info_hash: Sha1Hash,
    client_id: PeerId,
    listen_port: Option<u16>,
    send_handshake: bool,
    peer_handshake: Option<Handshake>,
) -> Result<HandshakeOutcome> {
    let (socket, io_state) = io.into_parts();
    let mut framed = Framed::new(socket, HandshakeCodec { io: io_state });

    if send_handshake {
        let our_handshake = Handshake::new(info_hash, client_id);
        framed.send(our_handshake).await?;
    }

    let peer_handshake = match peer_handshake {
        Some(handshake) => handshake,
        None => framed
            .next()
            .await
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection during handshake",
                ))
            })??,
    };

    if peer_handshake.info_hash != info_hash {
        return Err(Error::InvalidInfoHash);
    }

    let use_ltep = peer_handshake.advertises_ltep();

    let parts = framed.into_parts();
    let mut peer_parts = FramedParts::new(parts.io, PeerCodec::new(parts.codec.io));
    peer_parts.read_buf = parts.read_buf;
    peer_parts.write_buf = parts.write_buf;
    let mut framed = Framed::from_parts(peer_parts);

    let mut extended = None;
    if use_ltep {
        let our_ext = ltep::encode_handshake(listen_port, CLIENT_VERSION);
        framed
            .send(Message::Extended {
                sub_id: LTEP_HANDSHAKE_SUB_ID,
                payload: our_ext,
            })
            .await?;

        // The peer's LTEP handshake in return is read by the protocol
        // engine's ordinary message loop once it takes over, not here.
        let _ = &mut extended;
    }

    Ok(HandshakeOutcome {
        framed,
        peer_id: peer_handshake.peer_id,
        extended,
    })
}

const CLIENT_VERSION: &str = "peerwire/0.1.0";

/// Drives the full inbound (responder) handshake. `obfuscated_lookup`
/// resolves the torrent a connecting initiator is asking about from its
/// obfuscated info hash; `Ok(None)` (no match) is a fatal protocol error
/// an unrecognized torrent is a fatal protocol error for the connection.
pub(crate) async fn inbound(
    mut io: PeerIo,
    client_id: PeerId,
    listen_port: Option<u16>,
    obfuscated_lookup: impl Fn(&Sha1Hash) -> Option<Sha1Hash>,
) -> Result<(HandshakeOutcome, Sha1Hash)> {
    // Peek the first 20 bytes to decide whether this is a plaintext BT
    // handshake or an MSE `Ya`.
    let head = io.read_bytes(20).await?;
    if head.as_slice() == PLAINTEXT_MARKER {
        // Plaintext initiator: the remaining 48 bytes of the handshake
        // follow directly; reconstruct them by prefixing what we already
        // consumed via a tiny in-memory splice using the handshake codec
        // over the still-open socket.
        let rest = io.read_bytes(48).await?;
        let mut full = Vec::with_capacity(68);
        full.extend_from_slice(&head);
        full.extend_from_slice(&rest);

        let (socket, io_state) = io.into_parts();
        let mut framed = Framed::new(socket, HandshakeCodec { io: io_state });
        let mut parts = framed.into_parts();
        parts.read_buf = BytesMut::from(&full[..]);
        framed = Framed::from_parts(parts);

        let peer_handshake = framed
            .next()
            .await
            .ok_or(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection during handshake",
            )))??;
        let info_hash = peer_handshake.info_hash;

        let parts = framed.into_parts();
        let io = PeerIo::from_accepted_parts(parts.io, parts.codec.io);
        let outcome = finish_bt_handshake(
            io,
            info_hash,
            client_id,
            listen_port,
            true,
            Some(peer_handshake),
        )
        .await?;
        return Ok((outcome, info_hash));
    }

    // MSE initiator: `head` is the first 20 bytes of `Ya`; read the
    // remaining 76 and whatever `PadA` follows up to the `req1` marker.
    let ya_rest = io.read_bytes(76).await?;
    let mut ya = [0u8; 96];
    ya[..20].copy_from_slice(&head);
    ya[20..].copy_from_slice(&ya_rest);

    let dh = DhKeyPair::generate();
    let secret = dh.shared_secret(&ya);
    let req1_expected = sha1(&[b"req1", &secret]);

    // Yb must go out now, before waiting on anything further from the
    // initiator: it already sent `Ya`/`PadA` without waiting for our reply,
    // so its next message (the `req1` marker onward) is only ever coming
    // after it has received `Yb` and derived the shared secret itself.
    // Sending this any later deadlocks both sides on each other's read.
    io.write(&dh.public_key()).await?;

    resync_on_marker(&mut io, &req1_expected).await?;

    let obfuscated = io.read_bytes(20).await?;
    let mut obfuscated_hash = [0u8; 20];
    obfuscated_hash.copy_from_slice(&obfuscated);
    let req3 = sha1(&[b"req3", &secret]);
    let req2 = xor20(&obfuscated_hash, &req3);

    let info_hash =
        obfuscated_lookup(&req2).ok_or(Error::UnknownObfuscatedHash)?;

    io.set_torrent_hash(info_hash);

    let enc_key = sha1(&[b"keyB", &secret, &info_hash]);
    let dec_key = sha1(&[b"keyA", &secret, &info_hash]);
    let encrypt = Rc4Stream::new(&enc_key);
    let mut decrypt = Rc4Stream::new(&dec_key);

    let crypto_provide_buf = io.read_bytes(4).await?;
    let mut crypto_provide_bytes = [0u8; 4];
    crypto_provide_bytes.copy_from_slice(&crypto_provide_buf);
    decrypt.apply_keystream(&mut crypto_provide_bytes);
    let crypto_provide = u32::from_be_bytes(crypto_provide_bytes);

    io.set_encryption(EncryptionMode::Rc4 {
        encrypt: Box::new(encrypt),
        decrypt: Box::new(decrypt),
    });

    let pad_c_len = io.read_u16().await? as usize;
    let _pad_c = io.read_bytes(pad_c_len).await?;
    let ia_len = io.read_u16().await? as usize;
    let ia = io.read_bytes(ia_len).await?;

    // `IA` carries the initiator's BT handshake itself (already decrypted
    // by `read_bytes` via the RC4 state set above), so there is no separate
    // plaintext handshake message to wait for afterwards.
    if ia.len() != 68 {
        return Err(Error::InvalidProtocolString);
    }
    let mut ia_buf = [0u8; 68];
    ia_buf.copy_from_slice(&ia);
    let peer_handshake = Handshake::from_bytes(&ia_buf)?;

    // Respond: VC, crypto_select, PadD.
    let crypto_select: u32 = if crypto_provide & 0b10 != 0 { 2 } else { 1 };
    let pad_d = {
        let mut rng = rand::thread_rng();
        let pad_d_len = rng.gen_range(0..512);
        let mut pad_d = vec![0u8; pad_d_len];
        rng.fill(&mut pad_d[..]);
        pad_d
    };

    let mut response = Vec::new();
    response.extend_from_slice(&[0u8; 8]);
    response.extend_from_slice(&crypto_select.to_be_bytes());
    response.extend_from_slice(&(pad_d.len() as u16).to_be_bytes());
    response.extend_from_slice(&pad_d);
    io.write(&response).await?;

    if crypto_select == 1 {
        io.set_encryption(EncryptionMode::Plaintext);
    }

    // Our own handshake hasn't gone out yet (only the initiator's `IA` field
    // carries one); it's sent normally below, over the now-negotiated
    // connection.
    let outcome = finish_bt_handshake(
        io,
        info_hash,
        client_id,
        listen_port,
        true,
        Some(peer_handshake),
    )
    .await?;
    Ok((outcome, info_hash))
}

/// Scans incoming bytes one at a time until the last 20 of them equal
/// `marker`, as the responder must do to find `SHA1("req1", S)` past an
/// unknown-length `PadA`.
async fn resync_on_marker(io: &mut PeerIo, marker: &[u8; 20]) -> Result<()> {
    const MAX_SCAN: usize = 512 + 20;
    let mut window: Vec<u8> = Vec::with_capacity(20);
    for _ in 0..MAX_SCAN {
        let byte = io.read_bytes(1).await?;
        window.push(byte[0]);
        if window.len() > 20 {
            window.remove(0);
        }
        if window.len() == 20 && window == marker {
            return Ok(());
        }
    }
    Err(Error::UnknownObfuscatedHash)
}

impl PeerIo {
    /// Reassembles a `PeerIo` from a split socket/state pair, used when a
    /// `Framed` wrapper needs to be unwrapped back into raw
    /// read/write-oriented helpers (e.g. continuing the MSE preamble
    /// after peeking the first handshake bytes).
    fn from_accepted_parts(
        socket: tokio::net::TcpStream,
        state: PeerIoState,
    ) -> Self {
        let addr = state.addr;
        let mut io = PeerIo::from_accepted(socket, addr);
        io.set_encryption(state.mode);
        if let Some(hash) = state.torrent_hash {
            io.set_torrent_hash(hash);
        }
        io
    }
}
