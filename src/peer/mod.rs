//! The peer subsystem: MSE handshakes, BEP 3/10 wire framing, and the
//! per-connection protocol engine.

mod codec;
mod handshake;
mod io;
mod ltep;
mod message;
mod session;

pub(crate) use codec::{Handshake, PeerCodec};
pub(crate) use handshake::{inbound, outbound, HandshakeOutcome};
pub use handshake::EncryptionPreference;
pub(crate) use io::{EncryptionMode, PeerIo, PeerIoState};
pub(crate) use message::{BlockRequest, Message, MessageId};
pub(crate) use session::{AddRequestOutcome, PeerSession};
