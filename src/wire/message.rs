//! The length-prefixed peer message format and its `tokio_util` codec.
//!
//! `<length prefix><message ID><payload>`, length prefix excludes itself
//! and a length of zero is a keep-alive with no ID and no payload.
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::instrument;

use super::{WireError, WireResult};

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;
// BEP 6 fast extension.
const ID_SUGGEST: u8 = 0x0D;
const ID_HAVE_ALL: u8 = 0x0E;
const ID_HAVE_NONE: u8 = 0x0F;
const ID_REJECT: u8 = 0x10;
const ID_ALLOWED_FAST: u8 = 0x11;
// BEP 10.
const ID_EXTENDED: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece_index: u32 },
    Suggest { piece_index: u32 },
    /// A BEP 10 extended message: `extended_id` 0 is the extension
    /// handshake itself, other values are negotiated per-connection.
    Extended { extended_id: u8, payload: Vec<u8> },
}

/// Frame codec for `PeerMessage`, enforcing a caller-supplied maximum
/// message size to bound memory use against a hostile or buggy peer.
pub struct PeerCodec {
    max_message_size: usize,
}

impl PeerCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for PeerCodec {
    type Item = PeerMessage;
    type Error = WireError;

    #[instrument(skip(self, src), level = "trace")]
    fn decode(&mut self, src: &mut BytesMut) -> WireResult<Option<PeerMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_message_size {
            return Err(WireError::MessageTooLarge(length, self.max_message_size));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        let id = src[4];
        let body = src[5..4 + length].to_vec();
        src.advance(4 + length);

        let message = match id {
            ID_CHOKE => PeerMessage::Choke,
            ID_UNCHOKE => PeerMessage::Unchoke,
            ID_INTERESTED => PeerMessage::Interested,
            ID_NOT_INTERESTED => PeerMessage::NotInterested,
            ID_HAVE => PeerMessage::Have {
                piece_index: read_u32(&body, 0)?,
            },
            ID_BITFIELD => PeerMessage::Bitfield(body),
            ID_REQUEST => PeerMessage::Request {
                index: read_u32(&body, 0)?,
                begin: read_u32(&body, 4)?,
                length: read_u32(&body, 8)?,
            },
            ID_PIECE => {
                if body.len() < 8 {
                    return Err(WireError::Malformed("piece message shorter than 8 bytes".to_string()));
                }
                PeerMessage::Piece {
                    index: read_u32(&body, 0)?,
                    begin: read_u32(&body, 4)?,
                    block: body[8..].to_vec(),
                }
            }
            ID_CANCEL => PeerMessage::Cancel {
                index: read_u32(&body, 0)?,
                begin: read_u32(&body, 4)?,
                length: read_u32(&body, 8)?,
            },
            ID_PORT => {
                if body.len() < 2 {
                    return Err(WireError::Malformed("port message shorter than 2 bytes".to_string()));
                }
                PeerMessage::Port(u16::from_be_bytes([body[0], body[1]]))
            }
            ID_SUGGEST => PeerMessage::Suggest {
                piece_index: read_u32(&body, 0)?,
            },
            ID_HAVE_ALL => PeerMessage::HaveAll,
            ID_HAVE_NONE => PeerMessage::HaveNone,
            ID_REJECT => PeerMessage::Reject {
                index: read_u32(&body, 0)?,
                begin: read_u32(&body, 4)?,
                length: read_u32(&body, 8)?,
            },
            ID_ALLOWED_FAST => PeerMessage::AllowedFast {
                piece_index: read_u32(&body, 0)?,
            },
            ID_EXTENDED => {
                if body.is_empty() {
                    return Err(WireError::Malformed("extended message has no extended id".to_string()));
                }
                PeerMessage::Extended {
                    extended_id: body[0],
                    payload: body[1..].to_vec(),
                }
            }
            other => return Err(WireError::UnknownMessageId(other)),
        };

        Ok(Some(message))
    }
}

fn read_u32(body: &[u8], offset: usize) -> WireResult<u32> {
    body.get(offset..offset + 4)
        .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(WireError::Malformed("message too short for its fixed fields".to_string()))
}

impl Encoder<PeerMessage> for PeerCodec {
    type Error = WireError;

    #[instrument(skip(self, dst), level = "trace")]
    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> WireResult<()> {
        let mut body = Vec::new();
        let id = match &item {
            PeerMessage::KeepAlive => {
                dst.put_u32(0);
                return Ok(());
            }
            PeerMessage::Choke => ID_CHOKE,
            PeerMessage::Unchoke => ID_UNCHOKE,
            PeerMessage::Interested => ID_INTERESTED,
            PeerMessage::NotInterested => ID_NOT_INTERESTED,
            PeerMessage::Have { piece_index } => {
                body.extend_from_slice(&piece_index.to_be_bytes());
                ID_HAVE
            }
            PeerMessage::Bitfield(bits) => {
                body.extend_from_slice(bits);
                ID_BITFIELD
            }
            PeerMessage::Request { index, begin, length } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                ID_REQUEST
            }
            PeerMessage::Piece { index, begin, block } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
                ID_PIECE
            }
            PeerMessage::Cancel { index, begin, length } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                ID_CANCEL
            }
            PeerMessage::Port(port) => {
                body.extend_from_slice(&port.to_be_bytes());
                ID_PORT
            }
            PeerMessage::Suggest { piece_index } => {
                body.extend_from_slice(&piece_index.to_be_bytes());
                ID_SUGGEST
            }
            PeerMessage::HaveAll => ID_HAVE_ALL,
            PeerMessage::HaveNone => ID_HAVE_NONE,
            PeerMessage::Reject { index, begin, length } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                ID_REJECT
            }
            PeerMessage::AllowedFast { piece_index } => {
                body.extend_from_slice(&piece_index.to_be_bytes());
                ID_ALLOWED_FAST
            }
            PeerMessage::Extended { extended_id, payload } => {
                body.push(*extended_id);
                body.extend_from_slice(payload);
                ID_EXTENDED
            }
        };

        let length = 1 + body.len();
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(id);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: PeerMessage) -> PeerMessage {
        let mut codec = PeerCodec::new(2 * 1024 * 1024);
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn round_trips_fixed_length_messages() {
        assert_eq!(round_trip(PeerMessage::Choke), PeerMessage::Choke);
        assert_eq!(round_trip(PeerMessage::Interested), PeerMessage::Interested);
        assert_eq!(round_trip(PeerMessage::HaveAll), PeerMessage::HaveAll);
    }

    #[test]
    fn round_trips_fast_extension_messages() {
        let suggest = PeerMessage::Suggest { piece_index: 7 };
        assert_eq!(round_trip(suggest.clone()), suggest);
        let allowed_fast = PeerMessage::AllowedFast { piece_index: 7 };
        assert_eq!(round_trip(allowed_fast.clone()), allowed_fast);
    }

    #[test]
    fn round_trips_request_and_piece() {
        let req = PeerMessage::Request { index: 1, begin: 2, length: 3 };
        assert_eq!(round_trip(req.clone()), req);
        let piece = PeerMessage::Piece { index: 1, begin: 0, block: vec![9, 9, 9] };
        assert_eq!(round_trip(piece.clone()), piece);
    }

    #[test]
    fn round_trips_extended_message() {
        let ext = PeerMessage::Extended { extended_id: 3, payload: vec![1, 2] };
        assert_eq!(round_trip(ext.clone()), ext);
    }

    #[test]
    fn keep_alive_has_zero_length_and_no_id() {
        let mut codec = PeerCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(PeerMessage::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn rejects_oversized_message_without_buffering_it() {
        let mut codec = PeerCodec::new(10);
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn does_not_reject_small_extended_payloads() {
        // A 1-byte extended-id-only payload is a valid, tiny extended message
        // and must not trip any minimum-size heuristic.
        let ext = PeerMessage::Extended { extended_id: 0, payload: vec![] };
        assert_eq!(round_trip(ext.clone()), ext);
    }
}
