//! `.torrent` output composition. Strictly speaking a caller's job, not the
//! fetch core's, but provided here since the CLI binary needs it and it has
//! no dependency on the fetch core beyond `InfoBlob`.
use crate::bencode::encoder::encode_to_vec;
use crate::bencode::BencodeValue;

use super::InfoBlob;

fn encode(value: &BencodeValue) -> Vec<u8> {
    encode_to_vec(value).expect("encoding a freshly-built BencodeValue cannot fail")
}

/// Builds the bencoded outer metainfo dict: `announce`, `announce-list`,
/// `info`, `creation date` and `created by`.
///
/// `info` is spliced in as `blob`'s raw bytes rather than decoded and
/// re-encoded: a fetched info dict isn't guaranteed to be canonical, and
/// re-encoding a non-canonical dict would change its bytes and invalidate
/// the info hash the whole fetch was built to preserve.
pub fn compose(blob: &InfoBlob, trackers: &[String], created_at: i64, created_by: &str) -> Vec<u8> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

    if let Some(first) = trackers.first() {
        entries.push((
            b"announce".to_vec(),
            encode(&BencodeValue::Bytes(first.clone().into_bytes())),
        ));
    }
    if !trackers.is_empty() {
        let tiers = trackers
            .iter()
            .map(|t| BencodeValue::List(vec![BencodeValue::Bytes(t.clone().into_bytes())]))
            .collect();
        entries.push((b"announce-list".to_vec(), encode(&BencodeValue::List(tiers))));
    }
    entries.push((
        b"created by".to_vec(),
        encode(&BencodeValue::Bytes(created_by.as_bytes().to_vec())),
    ));
    entries.push((b"creation date".to_vec(), encode(&BencodeValue::Integer(created_at))));
    entries.push((b"info".to_vec(), blob.as_bytes().to_vec()));

    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    out.push(b'd');
    for (key, value_bytes) in entries {
        out.extend_from_slice(&encode(&BencodeValue::Bytes(key)));
        out.extend_from_slice(&value_bytes);
    }
    out.push(b'e');
    out
}

/// Renders an outfile template, substituting `{name}` with the info dict's
/// sanitised `name` field and `{hash}` with the hex-lower info hash.
/// ASCII control characters (0x00–0x1F, 0x7F) and path separators in the
/// name are replaced with `_` so the result is always a safe single path
/// component.
pub fn render_outfile_template(template: &str, blob: &InfoBlob, info_hash: &crate::magnet::InfoHash) -> String {
    let name = blob.name().unwrap_or_default();
    let sanitised = sanitise_name(&name);
    template
        .replace("{name}", &sanitised)
        .replace("{hash}", &info_hash.to_hex())
}

fn sanitise_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\u{0}'..='\u{1F}' | '\u{7F}' => '_',
            '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder;
    use crate::magnet::InfoHash;
    use crate::torrent::info_hash;

    fn blob() -> (InfoBlob, InfoHash) {
        let bytes = b"d4:name5:a/b\x00ce".to_vec();
        let hash = InfoHash::from_bytes(info_hash::sha1(&bytes));
        (InfoBlob::verify(bytes, &hash).unwrap(), hash)
    }

    #[test]
    fn compose_inlines_info_and_builds_announce_list() {
        let (blob, _hash) = blob();
        let trackers = vec!["http://t1/announce".to_string(), "http://t2/announce".to_string()];
        let out = compose(&blob, &trackers, 1_700_000_000, "demagnetize/1.0");
        let decoded = decoder::decode(&out).unwrap();
        let dict = decoded.as_dict().unwrap();
        assert_eq!(dict.get(b"announce".as_slice()).unwrap().as_bytes().unwrap(), b"http://t1/announce");
        assert!(dict.contains_key(b"info".as_slice()));
    }

    #[test]
    fn render_outfile_template_sanitises_name_and_fills_hash() {
        let (blob, hash) = blob();
        let rendered = render_outfile_template("out/{name}-{hash}.torrent", &blob, &hash);
        assert!(!rendered.contains('\u{0}'));
        assert!(rendered.contains(&hash.to_hex()));
        assert!(rendered.contains("a_b_c"));
    }

    #[test]
    fn compose_preserves_non_canonical_info_bytes_verbatim() {
        // Valid bencode, but with dict keys out of sorted order: re-encoding
        // this after decoding it would reorder the keys and change the
        // bytes, which would in turn change the info hash.
        let bytes = b"d1:zi1e1:ai2ee".to_vec();
        let hash = InfoHash::from_bytes(info_hash::sha1(&bytes));
        let blob = InfoBlob::verify(bytes.clone(), &hash).unwrap();

        let out = compose(&blob, &[], 0, "demagnetize/1.0");
        let info_start = out.windows(bytes.len()).position(|w| w == bytes.as_slice());
        assert!(info_start.is_some(), "raw info bytes must appear verbatim in the output");
    }
}
