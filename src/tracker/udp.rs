//! UDP tracker announce (BEP 15), including the BEP 41 URL-data extension.
//!
//! Packing is done by hand with `byteorder` rather than through
//! `serde_bencode` (which only speaks bencode, not this protocol's raw
//! big-endian binary framing) or `serde` derives (which can't express the
//! variable-length BEP 41 option bytes appended after the fixed fields).
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::net::UdpSocket;
use tracing::debug;

use super::{AnnounceParams, AnnounceResult, TrackerError, TrackerResult};
use crate::config::FetchConfig;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);
/// BEP 15 allows up to 8 attempts (~3840s) of `15 * 2^n` backoff; this
/// crate uses a lower cap of 4 attempts (~4 minutes) since a metadata-only
/// fetch has its own overall deadline above the tracker layer.
const MAX_ATTEMPTS: u32 = 4;

/// Per-`(host, port)` cache of connection ids, since BEP 15 connection ids
/// are valid for 60s and a fresh one otherwise needs its own round trip.
static CONNECTION_CACHE: Mutex<Option<HashMap<(String, u16), (u64, Instant)>>> = Mutex::new(None);

fn cached_connection_id(host: &str, port: u16) -> Option<u64> {
    let mut guard = CONNECTION_CACHE.lock().unwrap();
    let cache = guard.get_or_insert_with(HashMap::new);
    match cache.get(&(host.to_string(), port)) {
        Some((id, obtained_at)) if obtained_at.elapsed() < CONNECTION_ID_TTL => Some(*id),
        _ => None,
    }
}

fn store_connection_id(host: &str, port: u16, id: u64) {
    let mut guard = CONNECTION_CACHE.lock().unwrap();
    let cache = guard.get_or_insert_with(HashMap::new);
    cache.insert((host.to_string(), port), (id, Instant::now()));
}

#[tracing::instrument(skip(params, config, rng), level = "debug")]
pub async fn announce(
    url: &url::Url,
    params: &AnnounceParams,
    config: &FetchConfig,
    rng: &crate::rng::SharedRng,
) -> TrackerResult<AnnounceResult> {
    // Unlike the HTTP transport, UDP's own BEP 15 retry schedule (below) is
    // its deadline; `config.announce_timeout` is not layered on top of it.
    let _ = config;
    let host = url.host_str().ok_or_else(|| TrackerError::InvalidUrl("missing host".to_string()))?;
    let port = url.port().unwrap_or(80);

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TrackerError::Network(e.to_string()))?
        .collect::<Vec<SocketAddr>>();
    if addrs.is_empty() {
        return Err(TrackerError::Network(format!("could not resolve {host}")));
    }

    let url_data = format!(
        "{}{}",
        url.path(),
        url.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let mut last_err = TrackerError::Timeout;
    for addr in addrs {
        match announce_one(addr, host, port, params, &url_data, rng).await {
            Ok(result) => return Ok(result),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

async fn announce_one(
    addr: SocketAddr,
    host: &str,
    port: u16,
    params: &AnnounceParams,
    url_data: &str,
    rng: &crate::rng::SharedRng,
) -> TrackerResult<AnnounceResult> {
    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await.map_err(|e| TrackerError::Network(e.to_string()))?;
    socket.connect(addr).await.map_err(|e| TrackerError::Network(e.to_string()))?;

    let connection_id = match cached_connection_id(host, port) {
        Some(id) => id,
        None => {
            let id = connect(&socket, rng).await?;
            store_connection_id(host, port, id);
            id
        }
    };

    announce_request(&socket, connection_id, params, url_data, rng).await
}

/// Sends `build_packet()` with the BEP 15 retry schedule (`15 * 2^n`
/// seconds per attempt, 0-indexed), returning the first response that
/// passes `parse`. `parse` returns `None` for a reply that should be
/// dropped and waited past (wrong transaction id, malformed), `Some(Err)`
/// for a reply that terminates the announce immediately (a tracker error
/// action), and `Some(Ok(value))` on success.
async fn send_with_retries<T>(
    socket: &UdpSocket,
    packet: &[u8],
    mut parse: impl FnMut(&[u8]) -> Option<TrackerResult<T>>,
) -> TrackerResult<T> {
    for attempt in 0..MAX_ATTEMPTS {
        socket.send(packet).await.map_err(|e| TrackerError::Network(e.to_string()))?;
        let budget = Duration::from_secs(15 * (1u64 << attempt));
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut buf = [0u8; 2048];
            match tokio::time::timeout(remaining, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if let Some(result) = parse(&buf[..n]) {
                        return result;
                    }
                    // Transaction id mismatch (or malformed): drop and keep
                    // waiting within this attempt's budget.
                }
                Ok(Err(e)) => return Err(TrackerError::Network(e.to_string())),
                Err(_) => break,
            }
        }
        debug!(attempt, "udp tracker attempt timed out, retrying");
    }
    Err(TrackerError::Timeout)
}

async fn connect(socket: &UdpSocket, rng: &crate::rng::SharedRng) -> TrackerResult<u64> {
    let transaction_id: u32 = rng.next_u32();
    let mut packet = Vec::with_capacity(16);
    packet.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
    packet.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
    packet.write_u32::<BigEndian>(transaction_id).unwrap();

    send_with_retries(socket, &packet, |resp| {
        if resp.len() < 16 {
            return None;
        }
        let mut cur = resp;
        let action = cur.read_u32::<BigEndian>().ok()?;
        let txn = cur.read_u32::<BigEndian>().ok()?;
        if txn != transaction_id {
            return None;
        }
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(cur).into_owned();
            return Some(Err(TrackerError::TrackerFailure(message)));
        }
        if action != ACTION_CONNECT {
            return None;
        }
        Some(cur.read_u64::<BigEndian>().map_err(|e| TrackerError::BadResponse(e.to_string())))
    })
    .await
}

async fn announce_request(
    socket: &UdpSocket,
    connection_id: u64,
    params: &AnnounceParams,
    url_data: &str,
    rng: &crate::rng::SharedRng,
) -> TrackerResult<AnnounceResult> {
    let transaction_id: u32 = rng.next_u32();
    let mut packet = Vec::with_capacity(98);
    packet.write_u64::<BigEndian>(connection_id).unwrap();
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
    packet.write_u32::<BigEndian>(transaction_id).unwrap();
    packet.extend_from_slice(&params.info_hash);
    packet.extend_from_slice(&params.peer_id);
    packet.write_u64::<BigEndian>(params.downloaded).unwrap();
    packet.write_u64::<BigEndian>(params.left).unwrap();
    packet.write_u64::<BigEndian>(params.uploaded).unwrap();
    packet.write_u32::<BigEndian>(2).unwrap(); // event: started
    packet.write_u32::<BigEndian>(0).unwrap(); // ip_address: default
    packet.write_u32::<BigEndian>(rng.next_u32()).unwrap(); // key
    packet.write_i32::<BigEndian>(params.numwant).unwrap();
    packet.write_u16::<BigEndian>(params.port).unwrap();

    append_url_data_options(&mut packet, url_data);

    send_with_retries(socket, &packet, |resp| parse_announce_response(resp, transaction_id))
        .await
}

/// Appends BEP 41 URL-data options after the fixed announce fields: each
/// option is `type (1 byte) + length (1 byte) + value`, split across
/// multiple type-2 options if the URL data is longer than 255 bytes, and
/// terminated with a type-0 end-of-options marker.
fn append_url_data_options(packet: &mut Vec<u8>, url_data: &str) {
    if url_data.is_empty() {
        return;
    }
    for chunk in url_data.as_bytes().chunks(255) {
        packet.push(2); // type: URL data
        packet.push(chunk.len() as u8);
        packet.extend_from_slice(chunk);
    }
    packet.push(0); // type: end of options
}

fn parse_announce_response(resp: &[u8], expected_txn: u32) -> Option<TrackerResult<AnnounceResult>> {
    if resp.len() < 8 {
        return None;
    }
    let mut cur = resp;
    let action = cur.read_u32::<BigEndian>().ok()?;
    let txn = cur.read_u32::<BigEndian>().ok()?;
    if txn != expected_txn {
        return None;
    }
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(cur).into_owned();
        debug!(%message, "udp tracker returned an error action");
        return Some(Err(TrackerError::TrackerFailure(message)));
    }
    if action != ACTION_ANNOUNCE || resp.len() < 20 {
        return None;
    }
    let interval = match cur.read_u32::<BigEndian>() {
        Ok(v) => v,
        Err(_) => return None,
    };
    let _leechers = cur.read_u32::<BigEndian>().ok()?;
    let _seeders = cur.read_u32::<BigEndian>().ok()?;

    let mut peers = Vec::new();
    while cur.len() >= 6 {
        let ip = Ipv4Addr::new(cur[0], cur[1], cur[2], cur[3]);
        let port = u16::from_be_bytes([cur[4], cur[5]]);
        peers.push(SocketAddr::new(IpAddr::V4(ip), port));
        cur = &cur[6..];
    }

    Some(Ok(AnnounceResult {
        peers,
        interval: Duration::from_secs(interval as u64),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_data_splits_across_255_byte_options() {
        let mut packet = Vec::new();
        let data = "a".repeat(300);
        append_url_data_options(&mut packet, &data);
        // Two type-2 options (255 + 45 bytes) then a type-0 terminator.
        assert_eq!(packet[0], 2);
        assert_eq!(packet[1], 255);
        let second_option_start = 2 + 255;
        assert_eq!(packet[second_option_start], 2);
        assert_eq!(packet[second_option_start + 1], 45);
        assert_eq!(*packet.last().unwrap(), 0);
    }

    #[test]
    fn short_url_data_is_a_single_option() {
        let mut packet = Vec::new();
        append_url_data_options(&mut packet, "/ann?x=1");
        assert_eq!(packet[0], 2);
        assert_eq!(packet[1], 8);
        assert_eq!(&packet[2..10], b"/ann?x=1");
        assert_eq!(packet[10], 0);
    }

    #[test]
    fn parses_announce_response_peers() {
        let mut resp = Vec::new();
        resp.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        resp.write_u32::<BigEndian>(42).unwrap();
        resp.write_u32::<BigEndian>(1800).unwrap();
        resp.write_u32::<BigEndian>(1).unwrap();
        resp.write_u32::<BigEndian>(2).unwrap();
        resp.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);

        let result = parse_announce_response(&resp, 42).unwrap().unwrap();
        assert_eq!(result.peers.len(), 1);
        assert_eq!(result.peers[0].port(), 0x1AE1);
    }

    #[test]
    fn error_action_surfaces_as_tracker_failure() {
        let mut resp = Vec::new();
        resp.write_u32::<BigEndian>(ACTION_ERROR).unwrap();
        resp.write_u32::<BigEndian>(42).unwrap();
        resp.extend_from_slice(b"bad info_hash");

        match parse_announce_response(&resp, 42) {
            Some(Err(TrackerError::TrackerFailure(msg))) => assert_eq!(msg, "bad info_hash"),
            other => panic!("expected a tracker failure, got {other:?}"),
        }
    }

    #[test]
    fn drops_response_with_wrong_transaction_id() {
        let mut resp = Vec::new();
        resp.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        resp.write_u32::<BigEndian>(1).unwrap();
        resp.write_u32::<BigEndian>(1800).unwrap();
        resp.write_u32::<BigEndian>(0).unwrap();
        resp.write_u32::<BigEndian>(0).unwrap();
        assert!(parse_announce_response(&resp, 42).is_none());
    }
}
