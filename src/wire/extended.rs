//! BEP 10 extension handshake and the BEP 9 `ut_metadata` messages carried
//! inside it.
use std::collections::BTreeMap;

use crate::bencode::{decoder, encoder, BencodeValue};

use super::{WireError, WireResult};

/// The `m` dictionary advertised by the peer, mapping extension names to
/// locally-chosen message ids, plus `metadata_size` when the peer has the
/// full info dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub metadata_size: Option<u64>,
}

const UT_METADATA: &str = "ut_metadata";

impl ExtendedHandshake {
    /// Builds the handshake this crate sends: it only ever requests
    /// metadata, so it only advertises `ut_metadata`.
    pub fn ours(local_ut_metadata_id: u8) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(UT_METADATA.to_string(), local_ut_metadata_id);
        Self {
            extensions,
            metadata_size: None,
        }
    }

    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions.get(UT_METADATA).copied()
    }

    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(name.as_bytes().to_vec(), BencodeValue::Integer(*id as i64));
        }
        let mut top = BTreeMap::new();
        top.insert(b"m".to_vec(), BencodeValue::Dict(m));
        if let Some(size) = self.metadata_size {
            top.insert(b"metadata_size".to_vec(), BencodeValue::Integer(size as i64));
        }
        Ok(encoder::encode_to_vec(&BencodeValue::Dict(top))?)
    }

    pub fn from_bytes(data: &[u8]) -> WireResult<Self> {
        let value = decoder::decode(data)?;
        let dict = value.as_dict()?;

        let mut extensions = BTreeMap::new();
        if let Some(m) = dict.get(b"m".as_slice()) {
            for (name, id) in m.as_dict()? {
                let name = String::from_utf8_lossy(name).into_owned();
                let id = id.as_int()?;
                if (0..=255).contains(&id) {
                    extensions.insert(name, id as u8);
                }
            }
        }

        let metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(|v| v.as_int().ok())
            .and_then(|i| u64::try_from(i).ok());

        Ok(Self {
            extensions,
            metadata_size,
        })
    }
}

/// A `ut_metadata` piece message (BEP 9), identified by its `msg_type`:
/// `Request` (0) asks for a piece, `Data` (1) carries one, `Reject` (2)
/// refuses to send one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, block: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        let mut dict = BTreeMap::new();
        let (msg_type, piece, total_size) = match self {
            MetadataMessage::Request { piece } => (0i64, *piece, None),
            MetadataMessage::Data { piece, total_size, .. } => (1i64, *piece, Some(*total_size)),
            MetadataMessage::Reject { piece } => (2i64, *piece, None),
        };
        dict.insert(b"msg_type".to_vec(), BencodeValue::Integer(msg_type));
        dict.insert(b"piece".to_vec(), BencodeValue::Integer(piece as i64));
        if let Some(total_size) = total_size {
            dict.insert(b"total_size".to_vec(), BencodeValue::Integer(total_size as i64));
        }
        let mut bytes = encoder::encode_to_vec(&BencodeValue::Dict(dict))?;
        if let MetadataMessage::Data { block, .. } = self {
            bytes.extend_from_slice(block);
        }
        Ok(bytes)
    }

    /// Parses a `ut_metadata` message, where the bencoded dict is followed
    /// (for `Data` only) by the raw metadata block with no length prefix of
    /// its own. The dict's own bencode framing tells us where it ends, via
    /// `decode_with_span` over the whole buffer.
    pub fn from_bytes(data: &[u8]) -> WireResult<Self> {
        let (value, dict_len) = decoder::decode_prefix(data)?;
        let dict = value.as_dict()?;
        let msg_type = dict
            .get(b"msg_type".as_slice())
            .ok_or(WireError::Malformed("ut_metadata message missing msg_type".to_string()))?
            .as_int()?;
        let piece = dict
            .get(b"piece".as_slice())
            .ok_or(WireError::Malformed("ut_metadata message missing piece".to_string()))?
            .as_int()? as u32;

        match msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            2 => Ok(MetadataMessage::Reject { piece }),
            1 => {
                let total_size = dict
                    .get(b"total_size".as_slice())
                    .ok_or(WireError::Malformed("ut_metadata data message missing total_size".to_string()))?
                    .as_int()? as u32;
                let block = data.get(dict_len..).unwrap_or_default().to_vec();
                Ok(MetadataMessage::Data { piece, total_size, block })
            }
            other => Err(WireError::Malformed(format!(
                "unknown ut_metadata msg_type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_handshake_round_trips() {
        let hs = ExtendedHandshake::ours(3);
        let bytes = hs.to_bytes().unwrap();
        let parsed = ExtendedHandshake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.ut_metadata_id(), Some(3));
    }

    #[test]
    fn parses_peer_metadata_size() {
        let mut theirs = ExtendedHandshake::ours(1);
        theirs.metadata_size = Some(16384);
        let bytes = theirs.to_bytes().unwrap();
        let parsed = ExtendedHandshake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.metadata_size, Some(16384));
    }

    #[test]
    fn metadata_request_round_trips() {
        let msg = MetadataMessage::Request { piece: 2 };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(MetadataMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn metadata_data_round_trips_with_trailing_block() {
        let msg = MetadataMessage::Data {
            piece: 0,
            total_size: 3,
            block: vec![1, 2, 3],
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(MetadataMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn metadata_reject_round_trips() {
        let msg = MetadataMessage::Reject { piece: 5 };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(MetadataMessage::from_bytes(&bytes).unwrap(), msg);
    }
}
