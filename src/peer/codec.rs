//! Wire framing for the peer protocol: the handshake codec used for the
//! first exchange on a connection, and the peer message codec used for
//! every exchange after that.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed 68-byte first exchange on a peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(1 + prot.len() + reserved.len() + info_hash.len() + peer_id.len());
        buf.put_u8(prot.len() as u8);
        buf.put(&prot[..]);
        buf.put(&reserved[..]);
        buf.put(&info_hash[..]);
        buf.put(&peer_id[..]);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        let handshake_len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < handshake_len {
            return Ok(None);
        }

        let mut buf = buf.split_to(handshake_len);
        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[..prot_len.min(19)]);
        buf.advance(prot_len);

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[..8]);
        buf.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[..20]);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// Single-byte message identifiers, per the peer wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            _ => {
                return Err(Error::InvalidTrackerResponse(format!(
                    "invalid message id {}",
                    value
                )))
            }
        })
    }
}

/// A fully decoded peer protocol message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: usize, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put(&bytes[..]);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put(&data[..]);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&buf[..4]);
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + msg_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut msg_buf = buf.split_to(msg_len);
        let id = std::convert::TryFrom::try_from(msg_buf[0])?;
        msg_buf.advance(1);

        use std::convert::TryInto;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                let piece_index = u32::from_be_bytes(msg_buf[..4].try_into().unwrap());
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bitfield = Bitfield::from_slice(&msg_buf[..]);
                Message::Bitfield(bitfield)
            }
            MessageId::Request => Message::Request(decode_block_info(&msg_buf)),
            MessageId::Block => {
                let piece_index =
                    u32::from_be_bytes(msg_buf[0..4].try_into().unwrap()) as usize;
                let offset = u32::from_be_bytes(msg_buf[4..8].try_into().unwrap());
                let data = msg_buf[8..].to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => Message::Cancel(decode_block_info(&msg_buf)),
        };

        Ok(Some(msg))
    }
}

fn decode_block_info(buf: &[u8]) -> BlockInfo {
    use std::convert::TryInto;
    let piece_index = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let offset = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let len = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn have_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have { piece_index: 42 }, &mut buf)
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Have { piece_index: 42 });
    }

    #[test]
    fn keepalive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &0u32.to_be_bytes()[..]);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn request_round_trips() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(block));
    }

    #[test]
    fn incomplete_message_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(5); // declares 5 bytes to follow
        buf.put_u8(MessageId::Have as u8);
        // missing the u32 piece index
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn recursive_processing_of_multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Choke, &mut buf).unwrap();
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();

        let first = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Message::Choke);
        let second = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, Message::Unchoke);
        assert!(buf.is_empty());
    }
}
