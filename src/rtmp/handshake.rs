//! RTMP handshake, server and client roles.
//!
//! The server accepts both the simple handshake and the complex
//! (digest-validated) variant that Flash-era encoders send for H.264. The
//! client role always performs the simple handshake, which every RTMP origin
//! accepts.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::{ProtocolError, RelayError};

const VERSION_BYTE: u8 = 0x03;
const HANDSHAKE_SIZE: usize = 1536;
const DIGEST_SIZE: usize = 32;

/// Server version advertised in a complex S1 (FMS 3.5-compatible).
const SERVER_VERSION: [u8; 4] = [0x01, 0x00, 0x05, 0x04];

/// HMAC key for validating client (Flash Player) digests.
const GENUINE_FP_KEY: &[u8; 30] = b"Genuine Adobe Flash Player 001";

/// HMAC key for producing server (Flash Media Server) digests.
const GENUINE_FMS_KEY: &[u8; 36] = b"Genuine Adobe Flash Media Server 001";

type HmacSha256 = Hmac<Sha256>;

/// Perform the server side of the handshake, auto-detecting simple vs
/// complex from C1.
pub async fn server_handshake<S>(stream: &mut S) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let c0 = stream.read_u8().await?;
    if c0 != VERSION_BYTE {
        return Err(ProtocolError::InvalidVersion(c0).into());
    }

    let mut c1 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c1).await?;

    // Simple C1s carry a zero client version; complex ones embed a digest at
    // a schema-dependent offset. Try schema 1 first, then schema 0.
    let is_simple = c1[4..8] == [0, 0, 0, 0];
    if !is_simple {
        for scheme in [1, 0] {
            if let Some(digest) = validate_digest(&c1, scheme) {
                return complex_server_response(stream, &digest, scheme).await;
            }
        }
    }

    simple_server_response(stream, &c1).await
}

/// Perform the client side of the handshake (always simple).
pub async fn client_handshake<S>(stream: &mut S) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c1 = vec![0u8; HANDSHAKE_SIZE];
    c1[0..4].copy_from_slice(&now_epoch().to_be_bytes());
    fill_random(&mut c1[8..]);

    stream.write_all(&[VERSION_BYTE]).await?;
    stream.write_all(&c1).await?;
    stream.flush().await?;

    let s0 = stream.read_u8().await?;
    if s0 != VERSION_BYTE {
        return Err(ProtocolError::InvalidVersion(s0).into());
    }

    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s1).await?;
    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s2).await?;

    // C2 echoes S1.
    stream.write_all(&s1).await?;
    stream.flush().await?;

    Ok(())
}

async fn simple_server_response<S>(stream: &mut S, c1: &[u8]) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let now = now_epoch();

    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    s1[0..4].copy_from_slice(&now.to_be_bytes());
    fill_random(&mut s1[8..]);

    // S2 echoes C1 with our timestamp in bytes 0..4 and the client epoch
    // copied into bytes 4..8.
    let mut s2 = c1.to_vec();
    s2[0..4].copy_from_slice(&now.to_be_bytes());
    s2[4..8].copy_from_slice(&c1[0..4]);

    stream.write_all(&[VERSION_BYTE]).await?;
    stream.write_all(&s1).await?;
    stream.write_all(&s2).await?;
    stream.flush().await?;

    let mut c2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;

    Ok(())
}

async fn complex_server_response<S>(
    stream: &mut S,
    c1_digest: &[u8],
    scheme: usize,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION_BYTE]).await?;

    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    s1[0..4].copy_from_slice(&now_epoch().to_be_bytes());
    s1[4..8].copy_from_slice(&SERVER_VERSION);
    fill_random(&mut s1[8..]);

    let offset = digest_offset(&s1, scheme);
    let digest = calc_digest(&s1, GENUINE_FMS_KEY, offset);
    s1[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);
    stream.write_all(&s1).await?;

    // S2: random filler whose trailing 32 bytes bind the client's C1 digest.
    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    fill_random(&mut s2);
    let temp_key = hmac_sha256(GENUINE_FMS_KEY, &[c1_digest]);
    let s2_digest = hmac_sha256(&temp_key, &[&s2[..HANDSHAKE_SIZE - DIGEST_SIZE]]);
    s2[HANDSHAKE_SIZE - DIGEST_SIZE..].copy_from_slice(&s2_digest);
    stream.write_all(&s2).await?;
    stream.flush().await?;

    let mut c2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;

    Ok(())
}

/// Digest offset inside a 1536-byte packet for the given schema:
/// schema 0 sums bytes 8..12 (offset base 12), schema 1 sums bytes 772..776
/// (offset base 776); either way modulo 728 keeps the digest in bounds.
fn digest_offset(packet: &[u8], scheme: usize) -> usize {
    let (sum_at, base) = if scheme == 0 { (8, 12) } else { (772, 776) };
    let sum: usize = packet[sum_at..sum_at + 4].iter().map(|&b| b as usize).sum();
    (sum % 728) + base
}

/// HMAC-SHA256 over the packet with the digest region excluded.
fn calc_digest(packet: &[u8], key: &[u8], offset: usize) -> [u8; DIGEST_SIZE] {
    hmac_sha256(key, &[&packet[..offset], &packet[offset + DIGEST_SIZE..]])
}

/// Validate the embedded digest for one schema; returns it when it matches.
fn validate_digest(packet: &[u8], scheme: usize) -> Option<[u8; DIGEST_SIZE]> {
    let offset = digest_offset(packet, scheme);
    if offset + DIGEST_SIZE > packet.len() {
        return None;
    }
    let expected = calc_digest(packet, GENUINE_FP_KEY, offset);
    if expected == packet[offset..offset + DIGEST_SIZE] {
        Some(expected)
    } else {
        None
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn now_epoch() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}
