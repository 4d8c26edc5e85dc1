//! Bencode encoding.
//!
//! `BTreeMap` already iterates dict keys in sorted order, so encoding a
//! dictionary is just a walk of the map; no extra sort step is needed.
use super::BencodeResult;
use super::BencodeValue;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, BencodeValue>) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::Bytes(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper returning the encoded bytes directly.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}
