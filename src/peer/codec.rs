//! The peer-wire protocol: the fixed-size handshake and the length-prefixed
//! message framing that follows it.
//!
//! A one-shot `HandshakeCodec` decodes the fixed 68-byte handshake; a
//! streaming `PeerCodec` takes over for the length-prefixed message stream
//! that follows, swapped in via `Framed::into_parts`/`from_parts` once the
//! handshake completes (see [`super::session`]).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PeerError;
use crate::{Bitfield, BlockInfo, PeerId, Sha1Hash};

/// The fixed BitTorrent protocol string, `pstrlen` byte implied by its
/// length (19).
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// The wire size of a handshake message: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// The BitTorrent handshake, exchanged once at the start of every peer
/// connection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.extend_from_slice(PROTOCOL_STRING);
        dst.extend_from_slice(&[0u8; 8]);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] != PROTOCOL_STRING.len() as u8 {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        src.advance(1);
        let mut protocol = [0u8; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != *PROTOCOL_STRING {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut reserved = [0u8; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// A framed peer-wire message, following the handshake.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: usize },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: usize, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    /// A short name for logging, avoiding formatting the (possibly large)
    /// payload of `Piece` or `Bitfield`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeepAlive => "keep-alive",
            Self::Choke => "choke",
            Self::Unchoke => "unchoke",
            Self::Interested => "interested",
            Self::NotInterested => "not interested",
            Self::Have { .. } => "have",
            Self::Bitfield(_) => "bitfield",
            Self::Request(_) => "request",
            Self::Piece { .. } => "piece",
            Self::Cancel(_) => "cancel",
        }
    }
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
}

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(id::CHOKE);
            }
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(id::UNCHOKE);
            }
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(id::INTERESTED);
            }
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id::NOT_INTERESTED);
            }
            Message::Have { piece_index } => {
                dst.put_u32(5);
                dst.put_u8(id::HAVE);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(id::BITFIELD);
                dst.extend_from_slice(&bytes);
            }
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(id::REQUEST);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Piece { piece_index, offset, data } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(id::PIECE);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(id::CANCEL);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg_id = src.get_u8();
        let msg = match msg_id {
            id::CHOKE => Message::Choke,
            id::UNCHOKE => Message::Unchoke,
            id::INTERESTED => Message::Interested,
            id::NOT_INTERESTED => Message::NotInterested,
            id::HAVE => Message::Have { piece_index: src.get_u32() as usize },
            id::BITFIELD => {
                let mut bytes = vec![0u8; len - 1];
                src.copy_to_slice(&mut bytes);
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            id::REQUEST => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let block_len = src.get_u32();
                Message::Request(BlockInfo { piece_index, offset, len: block_len })
            }
            id::PIECE => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let mut data = vec![0u8; len - 9];
                src.copy_to_slice(&mut data);
                Message::Piece { piece_index, offset, data }
            }
            id::CANCEL => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let block_len = src.get_u32();
                Message::Cancel(BlockInfo { piece_index, offset, len: block_len })
            }
            other => return Err(PeerError::InvalidMessageId(other)),
        };

        Ok(Some(msg))
    }
}
