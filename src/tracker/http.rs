//! HTTP(S) tracker announce.
//!
//! Adapted from the original client's `tracker::Client`: build a query
//! string by hand (so `info_hash`/`peer_id` get raw-byte percent-encoding
//! rather than UTF-8 percent-encoding), GET it, and decode the bencoded
//! response body with `serde_bencode`.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{AnnounceParams, AnnounceResult, TrackerError, TrackerResult};
use crate::config::FetchConfig;

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
    #[serde(default)]
    peers6: Option<Peers6>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(serde_bytes::ByteBuf::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers6 {
    Compact(serde_bytes::ByteBuf),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

#[tracing::instrument(skip(params, config), level = "debug")]
pub async fn announce(
    url: &url::Url,
    params: &AnnounceParams,
    config: &FetchConfig,
) -> TrackerResult<AnnounceResult> {
    let mut url = url.clone();
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event=started&numwant={}",
        url_encode(&params.info_hash),
        url_encode(&params.peer_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        params.numwant,
    );
    url.set_query(Some(&query));

    debug!(%url, "sending HTTP tracker announce");

    let client = reqwest::Client::new();
    let response = tokio::time::timeout(config.announce_timeout, client.get(url).send())
        .await
        .map_err(|_| TrackerError::Timeout)?
        .map_err(|e| TrackerError::Network(e.to_string()))?;

    let body = tokio::time::timeout(config.announce_timeout, response.bytes())
        .await
        .map_err(|_| TrackerError::Timeout)?
        .map_err(|e| TrackerError::Network(e.to_string()))?;

    parse_announce_response(&body)
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResult> {
    let parsed: TrackerResponse =
        serde_bencode::from_bytes(bytes).map_err(|e| TrackerError::BadResponse(e.to_string()))?;

    if let Some(reason) = parsed.failure_reason {
        return Err(TrackerError::TrackerFailure(reason));
    }

    let mut peers = match parsed.peers {
        Peers::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect::<Vec<_>>(),
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| dict.ip.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, dict.port)))
            .collect(),
    };

    if let Some(Peers6::Compact(bytes)) = parsed.peers6 {
        peers.extend(bytes.chunks_exact(18).map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        }));
    }

    Ok(AnnounceResult {
        peers,
        interval: Duration::from_secs(parsed.interval.max(0) as u64),
    })
}

/// RFC 3986 percent-encoding of raw bytes. `info_hash` and `peer_id` are
/// arbitrary bytes, not UTF-8 text, so the `url` crate's text-oriented
/// encoders cannot be used here.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}
