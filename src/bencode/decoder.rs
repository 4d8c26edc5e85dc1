//! Bencode decoding.
//!
//! This crate needs the exact byte range of the `info` dictionary inside a
//! metainfo-like dict (to hash it without re-encoding), which is only
//! practical to track against a fully-buffered slice, so decoding here is a
//! recursive-descent parser over `&[u8]` with an explicit cursor rather
//! than a generic `Read` stream. Leading zeros, negative zero, unterminated
//! containers and non-numeric length prefixes are all rejected.
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::BTreeMap;
use std::ops::Range;
use tracing::instrument;

/// Cursor over a byte slice being decoded.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn next(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, b: u8) -> BencodeResult<()> {
        let got = self.next()?;
        if got != b {
            return Err(BencodeError::InvalidFormat(format!(
                "expected '{}', found '{}'",
                b as char, got as char
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEof)?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Reads bytes up to (and consuming) `delimiter`, returning them as a string.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<String> {
        let start = self.pos;
        loop {
            let b = self.peek()?;
            if b == delimiter {
                let s = std::str::from_utf8(&self.data[start..self.pos])
                    .map_err(|e| {
                        BencodeError::InvalidFormat(format!(
                            "non-UTF8 characters in length/integer: {e}"
                        ))
                    })?
                    .to_string();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
    }
}

/// Decodes a bencode byte string (`<length>:<data>`).
#[instrument(skip(cur), level = "trace")]
fn decode_string(cur: &mut Cursor) -> BencodeResult<Vec<u8>> {
    let length_str = cur.read_until(b':')?;
    if length_str.len() > 1 && length_str.starts_with('0') {
        return Err(BencodeError::InvalidStringLength);
    }
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    Ok(cur.take(length)?.to_vec())
}

/// Decodes a bencode integer (`i<number>e`).
///
/// Rejects leading zeros (except a lone `0`), `-0`, and an empty body.
#[instrument(skip(cur), level = "trace")]
fn decode_integer(cur: &mut Cursor) -> BencodeResult<i64> {
    cur.expect(b'i')?;
    let num_str = cur.read_until(b'e')?;

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let digits = num_str.strip_prefix('-').unwrap_or(&num_str);
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }

    num_str
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencode list (`l<items>e`), recursing into `decode_next` for each item.
#[instrument(skip(cur), level = "trace")]
fn decode_list(cur: &mut Cursor) -> BencodeResult<Vec<BencodeValue>> {
    cur.expect(b'l')?;
    let mut list = Vec::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        list.push(decode_next(cur)?);
    }
    Ok(list)
}

/// Decodes a bencode dictionary (`d<key><value>...e`).
///
/// Decoding is lenient on key order and duplicate keys (last write wins);
/// the encoder is what enforces sorted, unique keys on the way back out.
#[instrument(skip(cur), level = "trace")]
fn decode_dict(cur: &mut Cursor) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
    cur.expect(b'd')?;
    let mut dict = BTreeMap::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        let key = decode_string(cur)?;
        let value = decode_next(cur)?;
        dict.insert(key, value);
    }
    Ok(dict)
}

#[instrument(skip(cur), level = "trace")]
fn decode_next(cur: &mut Cursor) -> BencodeResult<BencodeValue> {
    match cur.peek()? {
        b'0'..=b'9' => decode_string(cur).map(BencodeValue::Bytes),
        b'i' => decode_integer(cur).map(BencodeValue::Integer),
        b'l' => decode_list(cur).map(BencodeValue::List),
        b'd' => decode_dict(cur).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected character: {}",
            other as char
        ))),
    }
}

/// Decodes a single top-level bencode value, failing on trailing garbage.
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cur = Cursor::new(data);
    let value = decode_next(&mut cur)?;
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes a single bencode value from the front of `data` and returns it
/// alongside how many bytes it occupied, leaving any trailing bytes
/// unexamined. Used where a bencoded value is itself a prefix of a larger
/// buffer, such as a `ut_metadata` `data` message whose raw metadata block
/// follows the dict with no framing of its own.
pub fn decode_prefix(data: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut cur = Cursor::new(data);
    let value = decode_next(&mut cur)?;
    Ok((value, cur.pos))
}

/// Decodes a top-level dictionary and returns it alongside the exact byte
/// range occupied by the value stored under `key`, so the caller can hash
/// (or otherwise reuse) those bytes verbatim instead of re-encoding them.
///
/// Used by `torrent::info_hash` to compute the SHA-1 of the `info` value
/// inside a metainfo dict without risking a re-encode that diverges from
/// whatever byte-for-byte form the remote peer actually sent.
pub fn decode_with_span(
    data: &[u8],
    key: &[u8],
) -> BencodeResult<(BencodeValue, Option<Range<usize>>)> {
    let mut cur = Cursor::new(data);
    cur.expect(b'd')?;
    let mut dict = BTreeMap::new();
    let mut span = None;
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        let k = decode_string(&mut cur)?;
        let value_start = cur.pos;
        let value = decode_next(&mut cur)?;
        if k == key {
            span = Some(value_start..cur.pos);
        }
        dict.insert(k, value);
    }
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok((BencodeValue::Dict(dict), span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        assert_eq!(decode(b"5:hello").unwrap(), BencodeValue::Bytes(b"hello".to_vec()));
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_leading_zero_and_negative_zero() {
        assert!(decode(b"i042e").is_err());
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn decodes_list_and_dict() {
        assert_eq!(
            decode(b"li42ei-1ee").unwrap(),
            BencodeValue::List(vec![BencodeValue::Integer(42), BencodeValue::Integer(-1)])
        );
        let d = decode(b"d3:fooi1ee").unwrap();
        let map = d.as_dict().unwrap();
        assert_eq!(map.get(b"foo".as_slice()).unwrap().as_int().unwrap(), 1);
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(decode(b"i1eX").is_err());
    }

    #[test]
    fn rejects_unterminated_container() {
        assert!(decode(b"li1e").is_err());
        assert!(decode(b"d3:fooi1e").is_err());
    }

    #[test]
    fn span_of_info_key_hashes_verbatim() {
        let metainfo = b"d8:announce3:foo4:infod4:name3:abceee";
        let (value, span) = decode_with_span(metainfo, b"info").unwrap();
        let span = span.unwrap();
        assert_eq!(&metainfo[span], b"d4:name3:abce".as_slice());
        assert!(value.get(b"announce").unwrap().is_some());
    }
}
