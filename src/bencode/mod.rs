//! Bencode value model and error handling.
//!
//! Bencode is BitTorrent's canonical serialisation: byte strings, signed
//! integers, ordered lists and ordered string-keyed dictionaries. It backs
//! tracker HTTP response bodies, peer extended messages, and the info
//! dictionary whose SHA-1 is the torrent's identity.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded Bencode value.
///
/// Dictionaries use a `BTreeMap` rather than a `HashMap` so that iteration
/// order is always key-sorted: re-encoding a value built in-process then
/// always produces the canonical, sorted-keys form the protocol requires.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> BencodeResult<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Ok(b),
            other => Err(BencodeError::SchemaMismatch {
                expected: "byte string",
                found: other.kind(),
            }),
        }
    }

    pub fn as_int(&self) -> BencodeResult<i64> {
        match self {
            BencodeValue::Integer(i) => Ok(*i),
            other => Err(BencodeError::SchemaMismatch {
                expected: "integer",
                found: other.kind(),
            }),
        }
    }

    pub fn as_list(&self) -> BencodeResult<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Ok(l),
            other => Err(BencodeError::SchemaMismatch {
                expected: "list",
                found: other.kind(),
            }),
        }
    }

    pub fn as_dict(&self) -> BencodeResult<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Ok(d),
            other => Err(BencodeError::SchemaMismatch {
                expected: "dictionary",
                found: other.kind(),
            }),
        }
    }

    /// Looks up `key` in a dictionary value, failing with a schema error if
    /// this value isn't a dictionary.
    pub fn get(&self, key: &[u8]) -> BencodeResult<Option<&BencodeValue>> {
        Ok(self.as_dict()?.get(key))
    }

    fn kind(&self) -> &'static str {
        match self {
            BencodeValue::Bytes(_) => "byte string",
            BencodeValue::Integer(_) => "integer",
            BencodeValue::List(_) => "list",
            BencodeValue::Dict(_) => "dictionary",
        }
    }
}

/// Error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("trailing data after top-level value")]
    TrailingData,

    #[error("expected {expected}, found {found}")]
    SchemaMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
