//! The crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result`], which is
//! `std::result::Result<T, Error>`. Transport failures and protocol
//! violations are both represented here since, per the peer subsystem's
//! error model, a protocol violation is torn down exactly like a transport
//! error: the distinction only matters for logging and for whether a retry
//! is ever attempted (it never is, except for the one-shot MSE plaintext
//! fallback, which is handled inline rather than through this enum).

use std::fmt;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// The underlying socket errored or was closed.
    Io(io::Error),
    /// The socket did not produce a complete handshake/message within the
    /// configured timeout.
    Timeout,
    /// A `connect()` was refused by the remote host.
    ConnectionRefused,

    /// The BT handshake's `pstrlen`/protocol string did not match
    /// `"BitTorrent protocol"`.
    InvalidProtocolString,
    /// The peer's advertised info hash does not match the torrent we
    /// expected to speak to it about.
    InvalidInfoHash,
    /// A BITFIELD message's length did not match the torrent's piece count.
    BitfieldLengthMismatch,
    /// A BITFIELD (or other availability-only) message arrived outside the
    /// availability-exchange phase of the session.
    BitfieldNotAfterHandshake,
    /// An unrecognized BT message id was received.
    UnknownMessageId(u8),
    /// An LTEP payload was not a well-formed bencoded dictionary.
    InvalidLtepPayload,
    /// A PEX payload's compact peer list was not a multiple of 6 bytes.
    InvalidPexPayload,
    /// Bencode could not be parsed.
    InvalidBencode,

    /// The MSE responder could not find a torrent matching the obfuscated
    /// hash derived from the initiator's handshake.
    UnknownObfuscatedHash,
    /// `crypto_select` was neither 1 (plaintext) nor 2 (RC4).
    InvalidCryptoSelect,
    /// MSE negotiation failed and the session's preference was
    /// `EncryptionRequired`, so no plaintext fallback is permitted.
    EncryptionRequired,

    /// A peer session was asked to act on a torrent that the manager does
    /// not know about.
    InvalidTorrentId,
    /// Metainfo could not be decoded.
    Metainfo(serde_bencode::Error),
    /// A metainfo file was well-formed bencode but violated the .torrent
    /// schema (e.g. a `pieces` string not a multiple of 20 bytes, or
    /// neither `length` nor `files` present).
    InvalidMetainfo,
    /// A piece index was out of range for the torrent's piece count.
    InvalidPieceIndex,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Timeout => write!(f, "timed out"),
            Error::ConnectionRefused => write!(f, "connection refused"),
            Error::InvalidProtocolString => {
                write!(f, "invalid protocol string in handshake")
            }
            Error::InvalidInfoHash => write!(f, "info hash mismatch"),
            Error::BitfieldLengthMismatch => {
                write!(f, "bitfield length does not match piece count")
            }
            Error::BitfieldNotAfterHandshake => {
                write!(f, "bitfield received outside availability exchange")
            }
            Error::UnknownMessageId(id) => {
                write!(f, "unknown bittorrent message id {}", id)
            }
            Error::InvalidLtepPayload => write!(f, "invalid ltep payload"),
            Error::InvalidPexPayload => write!(f, "invalid pex payload"),
            Error::InvalidBencode => write!(f, "invalid bencode"),
            Error::UnknownObfuscatedHash => {
                write!(f, "no torrent matches the obfuscated info hash")
            }
            Error::InvalidCryptoSelect => write!(f, "invalid crypto_select"),
            Error::EncryptionRequired => {
                write!(f, "encryption required but negotiation failed")
            }
            Error::InvalidTorrentId => write!(f, "unknown torrent id"),
            Error::Metainfo(e) => write!(f, "metainfo error: {}", e),
            Error::InvalidMetainfo => write!(f, "malformed metainfo"),
            Error::InvalidPieceIndex => write!(f, "piece index out of range"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Metainfo(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "channel receiver dropped",
        ))
    }
}
