//! Wire framing for the BitTorrent handshake and the regular message
//! stream, as `tokio_util::codec::Decoder`/`Encoder` pairs so both can be
//! driven through a `tokio_util::codec::Framed` the way the reference client
//! already frames its (plaintext-only) handshake and messages.
//!
//! Both codecs own a [`PeerIoState`] and use it to decrypt/encrypt every
//! byte exactly once, in stream order, as it is split off the incoming
//! buffer or appended to the outgoing one — this is what keeps the RC4
//! keystreams in both directions synchronized with the peer's.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::peer::io::PeerIoState;
use crate::peer::message::{BlockRequest, Message, MessageId};
use crate::{Bitfield, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Reserved-byte bit advertising LTEP (BEP 10) support.
pub(crate) const RESERVED_LTEP_BIT: u8 = 0x10;
/// Reserved-byte bit advertising the (legacy) Azureus extension protocol.
pub(crate) const RESERVED_AZMP_BIT: u8 = 0x80;

/// The 68-byte BitTorrent handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub(crate) reserved: [u8; 8],
    pub(crate) info_hash: Sha1Hash,
    pub(crate) peer_id: PeerId,
}

impl Handshake {
    pub(crate) fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= RESERVED_LTEP_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub(crate) fn advertises_ltep(&self) -> bool {
        self.reserved[5] & RESERVED_LTEP_BIT != 0
    }

    pub(crate) fn advertises_azmp(&self) -> bool {
        self.reserved[0] & RESERVED_AZMP_BIT != 0
    }

    pub(crate) fn to_bytes(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8; 68]) -> Result<Self> {
        if buf[0] != 19 || &buf[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocolString);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// Frames the fixed-size 68-byte handshake, applying whatever encryption
/// mode `io` is currently configured with (plaintext for an unencrypted
/// session, RC4 if MSE negotiated it).
pub(crate) struct HandshakeCodec {
    pub(crate) io: PeerIoState,
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>> {
        if src.len() < 68 {
            return Ok(None);
        }
        let mut chunk = src.split_to(68);
        self.io.decrypt_incoming(&mut chunk);
        self.io.record_download(68);
        let mut buf = [0u8; 68];
        buf.copy_from_slice(&chunk);
        Handshake::from_bytes(&buf).map(Some)
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Handshake,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let mut bytes = item.to_bytes();
        self.io.encrypt_outgoing(&mut bytes);
        self.io.record_upload(bytes.len() as u32);
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// The framing state machine for the regular message stream, matching
/// a length-prefix state machine: `AWAITING_LENGTH -> AWAITING_ID ->
/// [AWAITING_PIECE_HEADER -> READING_PIECE | AWAITING_BODY]`. `Piece` bodies are accumulated across
/// however many `decode` calls it takes for the bytes to arrive, so a
/// single PIECE message can straddle an arbitrary number of socket reads.
enum DecodeState {
    AwaitingLength,
    AwaitingId { body_len: u32 },
    AwaitingPieceHeader { remaining_body: u32 },
    ReadingPiece {
        piece_index: PieceIndex,
        offset: u32,
        remaining: u32,
        data: Vec<u8>,
    },
    AwaitingBody {
        id: MessageId,
        remaining: u32,
        data: Vec<u8>,
    },
}

pub(crate) struct PeerCodec {
    pub(crate) io: PeerIoState,
    state: DecodeState,
}

impl PeerCodec {
    pub(crate) fn new(io: PeerIoState) -> Self {
        Self {
            io,
            state: DecodeState::AwaitingLength,
        }
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>> {
        loop {
            match &mut self.state {
                DecodeState::AwaitingLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let mut chunk = src.split_to(4);
                    self.io.decrypt_incoming(&mut chunk);
                    self.io.record_download(4);
                    let len = u32::from_be_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]);
                    if len == 0 {
                        // stay in AwaitingLength; keepalive carries no body
                        return Ok(Some(Message::KeepAlive));
                    }
                    self.state = DecodeState::AwaitingId { body_len: len };
                }
                DecodeState::AwaitingId { body_len } => {
                    let body_len = *body_len;
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let mut chunk = src.split_to(1);
                    self.io.decrypt_incoming(&mut chunk);
                    self.io.record_download(1);
                    let id = chunk[0];
                    let remaining_body = body_len - 1;
                    match MessageId::from_u8(id) {
                        Some(MessageId::Piece) => {
                            if remaining_body < 8 {
                                return Err(Error::InvalidLtepPayload);
                            }
                            self.state = DecodeState::AwaitingPieceHeader {
                                remaining_body,
                            };
                        }
                        Some(message_id) => {
                            self.state = DecodeState::AwaitingBody {
                                id: message_id,
                                remaining: remaining_body,
                                data: Vec::with_capacity(
                                    remaining_body as usize,
                                ),
                            };
                        }
                        None => return Err(Error::UnknownMessageId(id)),
                    }
                }
                DecodeState::AwaitingPieceHeader { remaining_body } => {
                    let remaining_body = *remaining_body;
                    if src.len() < 8 {
                        return Ok(None);
                    }
                    let mut chunk = src.split_to(8);
                    self.io.decrypt_incoming(&mut chunk);
                    self.io.record_download(8);
                    let piece_index = u32::from_be_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]) as PieceIndex;
                    let offset = u32::from_be_bytes([
                        chunk[4], chunk[5], chunk[6], chunk[7],
                    ]);
                    let remaining = remaining_body - 8;
                    self.state = DecodeState::ReadingPiece {
                        piece_index,
                        offset,
                        remaining,
                        data: Vec::with_capacity(remaining as usize),
                    };
                }
                DecodeState::ReadingPiece {
                    piece_index,
                    offset,
                    remaining,
                    data,
                } => {
                    if *remaining == 0 {
                        let msg = Message::Piece {
                            piece_index: *piece_index,
                            offset: *offset,
                            data: std::mem::take(data),
                        };
                        self.state = DecodeState::AwaitingLength;
                        return Ok(Some(msg));
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remaining as usize).min(src.len());
                    let mut chunk = src.split_to(take);
                    self.io.decrypt_incoming(&mut chunk);
                    self.io.record_download(take as u32);
                    data.extend_from_slice(&chunk);
                    *remaining -= take as u32;
                }
                DecodeState::AwaitingBody { id, remaining, data } => {
                    if *remaining == 0 {
                        let msg = decode_body(*id, std::mem::take(data))?;
                        self.state = DecodeState::AwaitingLength;
                        return Ok(Some(msg));
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remaining as usize).min(src.len());
                    let mut chunk = src.split_to(take);
                    self.io.decrypt_incoming(&mut chunk);
                    self.io.record_download(take as u32);
                    data.extend_from_slice(&chunk);
                    *remaining -= take as u32;
                }
            }
        }
    }
}

fn decode_body(id: MessageId, data: Vec<u8>) -> Result<Message> {
    Ok(match id {
        MessageId::Choke => Message::Choke,
        MessageId::Unchoke => Message::Unchoke,
        MessageId::Interested => Message::Interested,
        MessageId::NotInterested => Message::NotInterested,
        MessageId::Have => {
            if data.len() != 4 {
                return Err(Error::InvalidLtepPayload);
            }
            let index = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            Message::Have(index as PieceIndex)
        }
        MessageId::Bitfield => {
            let mut bits = Bitfield::new();
            for &byte in &data {
                for bit in 0..8 {
                    bits.push(byte & (0x80 >> bit) != 0);
                }
            }
            Message::Bitfield(bits)
        }
        MessageId::Request => Message::Request(decode_block_request(&data)?),
        MessageId::Cancel => Message::Cancel(decode_block_request(&data)?),
        MessageId::Port => {
            if data.len() != 2 {
                return Err(Error::InvalidLtepPayload);
            }
            Message::Port(u16::from_be_bytes([data[0], data[1]]))
        }
        MessageId::Extended => {
            if data.is_empty() {
                return Err(Error::InvalidLtepPayload);
            }
            Message::Extended {
                sub_id: data[0],
                payload: data[1..].to_vec(),
            }
        }
        MessageId::Piece => unreachable!("handled by ReadingPiece state"),
    })
}

/// Packs a logical bitfield back into its compact wire representation,
/// most-significant bit first, padding the final byte with zero bits.
fn pack_bitfield(bits: &Bitfield) -> Vec<u8> {
    let byte_len = (bits.len() + 7) / 8;
    let mut out = vec![0u8; byte_len];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

fn decode_block_request(data: &[u8]) -> Result<BlockRequest> {
    if data.len() != 12 {
        return Err(Error::InvalidLtepPayload);
    }
    let piece_index =
        u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as PieceIndex;
    let offset = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let length = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    Ok(BlockRequest {
        piece_index,
        offset,
        length,
    })
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let mut body = Vec::new();
        if let Some(id) = item.id() {
            body.push(id as u8);
        }
        match item {
            Message::KeepAlive => {}
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => {
                body.extend_from_slice(&(index as u32).to_be_bytes());
            }
            Message::Bitfield(bits) => {
                body.extend_from_slice(&pack_bitfield(&bits));
            }
            Message::Request(r) | Message::Cancel(r) => {
                body.extend_from_slice(&(r.piece_index as u32).to_be_bytes());
                body.extend_from_slice(&r.offset.to_be_bytes());
                body.extend_from_slice(&r.length.to_be_bytes());
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                body.extend_from_slice(&(piece_index as u32).to_be_bytes());
                body.extend_from_slice(&offset.to_be_bytes());
                body.extend_from_slice(&data);
            }
            Message::Port(port) => {
                body.extend_from_slice(&port.to_be_bytes());
            }
            Message::Extended { sub_id, payload } => {
                body.push(sub_id);
                body.extend_from_slice(&payload);
            }
        }

        let len = body.len() as u32;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);

        self.io.encrypt_outgoing(&mut frame);
        self.io.record_upload(frame.len() as u32);
        dst.put_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::io::EncryptionMode;
    use std::net::SocketAddr;

    fn fresh_io() -> PeerIoState {
        PeerIoState {
            addr: "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
            mode: EncryptionMode::Plaintext,
            torrent_hash: None,
            upload_rate: crate::counter::RateCounter::new(),
            download_rate: crate::counter::RateCounter::new(),
        }
    }

    #[test]
    fn handshake_round_trips() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let hs = Handshake::new(info_hash, peer_id);
        let bytes = hs.to_bytes();
        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, hs);
        assert!(decoded.advertises_ltep());
    }

    #[test]
    fn handshake_rejects_bad_protocol_string() {
        let mut bytes = Handshake::new([0; 20], [0; 20]).to_bytes();
        bytes[0] = 18;
        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    fn roundtrip_message(msg: Message) -> Message {
        let mut codec = PeerCodec::new(fresh_io());
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        let mut decode_codec = PeerCodec::new(fresh_io());
        decode_codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn simple_messages_round_trip() {
        assert!(matches!(
            roundtrip_message(Message::Choke),
            Message::Choke
        ));
        assert!(matches!(
            roundtrip_message(Message::Unchoke),
            Message::Unchoke
        ));
        assert!(matches!(
            roundtrip_message(Message::Have(5)),
            Message::Have(5)
        ));
    }

    #[test]
    fn piece_message_round_trips_in_arbitrary_chunks() {
        let data = vec![42u8; 16 * 1024];
        let msg = Message::Piece {
            piece_index: 3,
            offset: 0,
            data: data.clone(),
        };

        let mut codec = PeerCodec::new(fresh_io());
        let mut encoded = BytesMut::new();
        codec.encode(msg, &mut encoded).unwrap();

        // Feed the encoded bytes to a fresh decoder in small, arbitrary
        // chunks to simulate partial socket reads.
        let mut decode_codec = PeerCodec::new(fresh_io());
        let all_bytes = encoded.to_vec();
        let mut buf = BytesMut::new();
        let mut result = None;
        for chunk in all_bytes.chunks(7) {
            buf.extend_from_slice(chunk);
            if let Some(msg) = decode_codec.decode(&mut buf).unwrap() {
                result = Some(msg);
                break;
            }
        }

        match result.expect("message should have decoded") {
            Message::Piece {
                piece_index,
                offset,
                data: got,
            } => {
                assert_eq!(piece_index, 3);
                assert_eq!(offset, 0);
                assert_eq!(got, data);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn keepalive_does_not_advance_message_state() {
        let mut codec = PeerCodec::new(fresh_io());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Message::KeepAlive));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Message::KeepAlive));
    }

    #[test]
    fn unknown_message_id_is_an_error() {
        let mut codec = PeerCodec::new(fresh_io());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&[200, 0]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
