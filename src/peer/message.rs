//! The regular (post-handshake) BitTorrent wire messages, BEP 3 plus the
//! BEP 10 extension message (id 20).

use crate::{Bitfield, PieceIndex};

/// A single BT message id, as it appears on the wire directly after the
/// 4-byte length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl MessageId {
    pub(crate) fn from_u8(id: u8) -> Option<Self> {
        use MessageId::*;
        Some(match id {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            20 => Extended,
            _ => return None,
        })
    }
}

/// A block request/cancel triple, as carried by REQUEST and CANCEL
/// messages (and used internally for the `peer_asked_for` /
/// `client_asked_for` queues).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRequest {
    pub(crate) piece_index: PieceIndex,
    pub(crate) offset: u32,
    pub(crate) length: u32,
}

/// A fully decoded BT message.
#[derive(Debug, Clone)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockRequest),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockRequest),
    Port(u16),
    Extended {
        sub_id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    pub(crate) fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }
}
