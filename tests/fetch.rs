//! End-to-end fetch scenarios driven against in-process fakes: a minimal
//! HTTP tracker and a minimal peer speaking the handshake + extended
//! handshake + `ut_metadata` wire format. Mirrors spec.md §8's E1/E2/E5.
use std::net::SocketAddr;
use std::time::Duration;

use demagnetizer::config::FetchConfig;
use demagnetizer::coordinator::{FetchCoordinator, FetchFailure};
use demagnetizer::magnet::{InfoHash, Magnet};
use demagnetizer::wire::{ExtendedHandshake, Handshake, MetadataMessage, PeerCodec, PeerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

const PIECE_SIZE: usize = 16 * 1024;
const FAKE_PEER_UT_METADATA_ID: u8 = 5;

/// Starts a one-shot HTTP tracker that replies to the first connection with
/// a compact-peers bencoded body naming `peer_addr`, then stops.
async fn spawn_fake_http_tracker(peer_addr: SocketAddr) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            // Read (and discard) the request line/headers up to the blank line.
            let mut total_read = 0;
            loop {
                let n = stream.read(&mut buf[total_read..]).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                total_read += n;
                if buf[..total_read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }

            let SocketAddr::V4(v4) = peer_addr else { panic!("test only supports IPv4 fake peers") };
            let mut compact = v4.ip().octets().to_vec();
            compact.extend_from_slice(&v4.port().to_be_bytes());

            let mut body = Vec::new();
            body.extend_from_slice(b"d8:intervali1800e5:peers");
            body.extend_from_slice(format!("{}:", compact.len()).as_bytes());
            body.extend_from_slice(&compact);
            body.extend_from_slice(b"e");

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{local}/announce")
}

/// Starts a one-shot fake peer serving `info_dict_bytes` over the
/// `ut_metadata` exchange. `pre_request_delay` simulates a slow peer (E5).
async fn spawn_fake_peer(info_hash: [u8; 20], info_dict_bytes: Vec<u8>, pre_request_delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let _ = serve_peer(stream, info_hash, info_dict_bytes, pre_request_delay).await;
        }
    });
    local
}

async fn serve_peer(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    info_dict_bytes: Vec<u8>,
    pre_request_delay: Duration,
) -> anyhow::Result<()> {
    let their_handshake = Handshake::read(&mut stream).await?;
    anyhow::ensure!(their_handshake.info_hash == info_hash, "info hash mismatch from client");

    let ours = Handshake::new(info_hash, [9u8; 20]);
    ours.write(&mut stream).await?;

    let mut framed = Framed::new(stream, PeerCodec::new(2 * 1024 * 1024));

    let mut client_ut_metadata_id = None;
    while client_ut_metadata_id.is_none() {
        match framed.next().await {
            Some(Ok(PeerMessage::Extended { extended_id: 0, payload })) => {
                let handshake = ExtendedHandshake::from_bytes(&payload)?;
                client_ut_metadata_id = handshake.ut_metadata_id();
            }
            Some(Ok(_)) => continue,
            _ => anyhow::bail!("connection closed before client extended handshake"),
        }
    }
    let client_ut_metadata_id = client_ut_metadata_id.unwrap();

    let mut ours_ext = ExtendedHandshake::ours(FAKE_PEER_UT_METADATA_ID);
    ours_ext.metadata_size = Some(info_dict_bytes.len() as u64);
    framed
        .send(PeerMessage::Extended { extended_id: 0, payload: ours_ext.to_bytes()? })
        .await?;

    if !pre_request_delay.is_zero() {
        tokio::time::sleep(pre_request_delay).await;
    }

    loop {
        match framed.next().await {
            Some(Ok(PeerMessage::Extended { extended_id, payload })) if extended_id == FAKE_PEER_UT_METADATA_ID => {
                if let MetadataMessage::Request { piece } = MetadataMessage::from_bytes(&payload)? {
                    let start = piece as usize * PIECE_SIZE;
                    let end = (start + PIECE_SIZE).min(info_dict_bytes.len());
                    let block = info_dict_bytes[start..end].to_vec();
                    let msg = MetadataMessage::Data { piece, total_size: info_dict_bytes.len() as u32, block };
                    framed
                        .send(PeerMessage::Extended { extended_id: client_ut_metadata_id, payload: msg.to_bytes()? })
                        .await?;
                }
            }
            Some(Ok(_)) => continue,
            _ => break,
        }
    }
    Ok(())
}

fn sample_info_dict(name: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"d4:name");
    bytes.extend_from_slice(format!("{}:", name.len()).as_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend_from_slice(b"6:lengthi32768ee");
    bytes
}

fn sha1(bytes: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

fn fast_config() -> FetchConfig {
    FetchConfig {
        announce_timeout: Duration::from_secs(5),
        peer_session_timeout: Duration::from_secs(5),
        read_idle_timeout: Duration::from_secs(3),
        overall_deadline: Duration::from_secs(10),
        ..FetchConfig::default()
    }
}

/// E1: one HTTP tracker, one peer serving a known info dict whose SHA-1
/// matches the magnet's hash. Fetch succeeds with the fake's exact bytes.
#[tokio::test]
async fn e1_successful_fetch_returns_matching_info_blob() {
    let info_dict = sample_info_dict("e1.bin");
    let hash_bytes = sha1(&info_dict);
    let peer_addr = spawn_fake_peer(hash_bytes, info_dict.clone(), Duration::ZERO).await;
    let tracker_url = spawn_fake_http_tracker(peer_addr).await;

    let magnet = Magnet::parse(&format!(
        "magnet:?xt=urn:btih:{}&tr={}",
        hex::encode(hash_bytes),
        tracker_url
    ))
    .unwrap();

    let coordinator = FetchCoordinator::new(fast_config());
    let blob = coordinator.fetch(&magnet).await.expect("fetch should succeed");
    assert_eq!(blob.as_bytes(), info_dict.as_slice());
}

/// E2: the peer serves an info blob whose SHA-1 differs from the magnet's
/// hash. The session must reject it and the overall fetch must fail.
#[tokio::test]
async fn e2_hash_mismatch_fails_the_fetch() {
    let served = sample_info_dict("e2-served.bin");
    let claimed_hash = sha1(sample_info_dict("e2-claimed.bin").as_slice());
    let peer_addr = spawn_fake_peer(claimed_hash, served, Duration::ZERO).await;
    let tracker_url = spawn_fake_http_tracker(peer_addr).await;

    let magnet = Magnet::parse(&format!(
        "magnet:?xt=urn:btih:{}&tr={}",
        hex::encode(claimed_hash),
        tracker_url
    ))
    .unwrap();

    let coordinator = FetchCoordinator::new(fast_config());
    let result = coordinator.fetch(&magnet).await;
    assert!(matches!(result, Err(FetchFailure::NoPeerSucceeded)));
}

/// E3: a base-32 `xt` resolves to the same info hash as the hex form and
/// the fetch proceeds identically.
#[tokio::test]
async fn e3_base32_and_hex_magnets_fetch_identically() {
    let info_dict = sample_info_dict("e3.bin");
    let hash_bytes = sha1(&info_dict);
    let peer_addr = spawn_fake_peer(hash_bytes, info_dict.clone(), Duration::ZERO).await;
    let tracker_url = spawn_fake_http_tracker(peer_addr).await;

    let base32 = base32_encode(&hash_bytes);
    let magnet = Magnet::parse(&format!("magnet:?xt=urn:btih:{base32}&tr={tracker_url}")).unwrap();
    assert_eq!(magnet.info_hash, InfoHash::from_bytes(hash_bytes));

    let coordinator = FetchCoordinator::new(fast_config());
    let blob = coordinator.fetch(&magnet).await.expect("fetch should succeed");
    assert_eq!(blob.as_bytes(), info_dict.as_slice());
}

/// E5: two peers race; the slow one must not win and the fast one's blob
/// must be returned.
#[tokio::test]
async fn e5_fastest_peer_wins() {
    let info_dict = sample_info_dict("e5.bin");
    let hash_bytes = sha1(&info_dict);

    let slow_peer = spawn_fake_peer(hash_bytes, info_dict.clone(), Duration::from_secs(5)).await;
    let fast_peer = spawn_fake_peer(hash_bytes, info_dict.clone(), Duration::ZERO).await;

    let magnet_uri = format!(
        "magnet:?xt=urn:btih:{}&x.pe={}&x.pe={}",
        hex::encode(hash_bytes),
        slow_peer,
        fast_peer
    );
    let magnet = Magnet::parse(&magnet_uri).unwrap();

    let coordinator = FetchCoordinator::new(fast_config());
    let started = std::time::Instant::now();
    let blob = coordinator.fetch(&magnet).await.expect("fetch should succeed");
    assert_eq!(blob.as_bytes(), info_dict.as_slice());
    assert!(started.elapsed() < Duration::from_secs(4), "should not have waited on the slow peer");
}

fn base32_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = String::new();
    for &b in bytes {
        bits = (bits << 8) | b as u64;
        bit_count += 8;
        while bit_count >= 5 {
            bit_count -= 5;
            out.push(ALPHABET[((bits >> bit_count) & 0x1F) as usize] as char);
        }
    }
    if bit_count > 0 {
        out.push(ALPHABET[((bits << (5 - bit_count)) & 0x1F) as usize] as char);
    }
    out
}
